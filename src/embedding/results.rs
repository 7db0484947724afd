//! Result buffers, allocated once and overwritten by every call

/// Descaled lookup results: per embedding, `nr_batches * nr_cols` values
/// laid out `[batch][col]`
#[derive(Debug, Clone, PartialEq)]
pub struct ResultBuffer {
    nr_batches: usize,
    nr_cols: usize,
    data: Vec<Vec<f32>>,
}

impl ResultBuffer {
    pub fn new(nr_embedding: usize, nr_batches: usize, nr_cols: usize) -> Self {
        Self {
            nr_batches,
            nr_cols,
            data: vec![vec![0.0; nr_batches * nr_cols]; nr_embedding],
        }
    }

    /// Reshape for a call with a different bag count, reusing storage
    pub fn reset(&mut self, nr_batches: usize) {
        self.nr_batches = nr_batches;
        let len = nr_batches * self.nr_cols;
        for values in &mut self.data {
            values.clear();
            values.resize(len, 0.0);
        }
    }

    pub fn nr_embedding(&self) -> usize {
        self.data.len()
    }

    pub fn nr_batches(&self) -> usize {
        self.nr_batches
    }

    pub fn nr_cols(&self) -> usize {
        self.nr_cols
    }

    /// All values of one embedding, `[batch][col]`
    pub fn embedding(&self, embedding: usize) -> &[f32] {
        &self.data[embedding]
    }

    /// Result vector of one bag
    pub fn bag(&self, embedding: usize, batch: usize) -> &[f32] {
        let start = batch * self.nr_cols;
        &self.data[embedding][start..start + self.nr_cols]
    }

    #[inline]
    pub fn get(&self, embedding: usize, batch: usize, col: usize) -> f32 {
        self.data[embedding][batch * self.nr_cols + col]
    }

    /// Per-embedding storage, for writers that fill tables in parallel
    pub(crate) fn embeddings_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.data
    }
}

/// Raw fixed-point partial sums gathered from every PE.
///
/// Single arena of `nr_pes * stride` values; PE `p` owns
/// `[p * stride, (p + 1) * stride)` laid out `[local_col][batch]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialResults {
    nr_pes: usize,
    cols_per_pe: usize,
    nr_batches: usize,
    data: Vec<i32>,
}

impl PartialResults {
    pub fn new(nr_pes: usize, cols_per_pe: usize, nr_batches: usize) -> Self {
        Self {
            nr_pes,
            cols_per_pe,
            nr_batches,
            data: vec![0; nr_pes * cols_per_pe * nr_batches],
        }
    }

    /// Reshape for a new bag count, reusing storage
    pub fn reset(&mut self, nr_batches: usize) {
        self.nr_batches = nr_batches;
        self.data.clear();
        self.data.resize(self.nr_pes * self.stride(), 0);
    }

    pub fn nr_pes(&self) -> usize {
        self.nr_pes
    }

    pub fn nr_batches(&self) -> usize {
        self.nr_batches
    }

    pub fn cols_per_pe(&self) -> usize {
        self.cols_per_pe
    }

    /// Values per PE
    pub fn stride(&self) -> usize {
        self.cols_per_pe * self.nr_batches
    }

    pub fn pe(&self, pe: usize) -> &[i32] {
        let stride = self.stride();
        &self.data[pe * stride..(pe + 1) * stride]
    }

    pub fn pe_mut(&mut self, pe: usize) -> &mut [i32] {
        let stride = self.stride();
        &mut self.data[pe * stride..(pe + 1) * stride]
    }

    #[inline]
    pub fn get(&self, pe: usize, local_col: usize, batch: usize) -> i32 {
        self.data[pe * self.stride() + local_col * self.nr_batches + batch]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_buffer_layout() {
        let mut results = ResultBuffer::new(2, 3, 4);
        results.embeddings_mut()[1][2 * 4 + 3] = 5.0;
        assert_eq!(results.get(1, 2, 3), 5.0);
        assert_eq!(results.bag(1, 2), &[0.0, 0.0, 0.0, 5.0]);

        results.reset(1);
        assert_eq!(results.embedding(0).len(), 4);
        assert_eq!(results.nr_batches(), 1);
    }

    #[test]
    fn test_partial_results_views() {
        let mut partials = PartialResults::new(3, 2, 4);
        assert_eq!(partials.stride(), 8);
        partials.pe_mut(1)[1 * 4 + 3] = 42;
        assert_eq!(partials.get(1, 1, 3), 42);
        assert_eq!(partials.pe(0), &[0; 8]);

        partials.reset(2);
        assert_eq!(partials.pe(2).len(), 4);
        assert_eq!(partials.get(1, 1, 1), 0);
    }
}
