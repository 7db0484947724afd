use crate::errors::{FleetError, Result};

/// One embedding table of quantised (`i32`) weights in row-major order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingTable {
    nr_rows: usize,
    nr_cols: usize,
    data: Vec<i32>,
}

impl EmbeddingTable {
    /// Wrap row-major data `[row][col]`
    pub fn from_row_major(nr_rows: usize, nr_cols: usize, data: Vec<i32>) -> Result<Self> {
        if data.len() != nr_rows * nr_cols {
            return Err(FleetError::InvalidTable(format!(
                "expected {} weights for {}x{}, got {}",
                nr_rows * nr_cols,
                nr_rows,
                nr_cols,
                data.len()
            )));
        }
        Ok(Self {
            nr_rows,
            nr_cols,
            data,
        })
    }

    /// Build a table from a generator called with `(row, col)`
    pub fn from_fn(nr_rows: usize, nr_cols: usize, mut f: impl FnMut(usize, usize) -> i32) -> Self {
        let data = (0..nr_rows * nr_cols)
            .map(|i| f(i / nr_cols, i % nr_cols))
            .collect();
        Self {
            nr_rows,
            nr_cols,
            data,
        }
    }

    pub fn nr_rows(&self) -> usize {
        self.nr_rows
    }

    pub fn nr_cols(&self) -> usize {
        self.nr_cols
    }

    pub fn as_row_major(&self) -> &[i32] {
        &self.data
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.data[row * self.nr_cols + col]
    }

    /// Column-major copy `[col][row]`: each column is contiguous so a PE
    /// owning a column range receives one contiguous slice.
    pub fn transpose(&self) -> Vec<i32> {
        let mut out = vec![0i32; self.data.len()];
        for row in 0..self.nr_rows {
            for col in 0..self.nr_cols {
                out[col * self.nr_rows + row] = self.data[row * self.nr_cols + col];
            }
        }
        out
    }
}
