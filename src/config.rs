use crate::errors::{FleetError, Result};
use crate::fleet::FleetLimits;
use crate::pipeline::MIN_DEPTH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Run configuration for the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub workload: WorkloadConfig,
    pub fleet: FleetLimits,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Synthetic workload shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub nr_embedding: usize,
    pub nr_rows: usize,
    pub nr_cols: usize,
    /// Bags per lookup call
    pub nr_batches: usize,
    pub nr_iterations: usize,
    pub seed: u64,
    pub indices_per_batch: IndicesPerBatch,
}

/// Number of indices in each bag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicesPerBatch {
    Fixed(usize),
    Random { min: usize, max: usize },
}

impl IndicesPerBatch {
    /// Largest bag this setting can produce
    pub fn max(&self) -> usize {
        match *self {
            IndicesPerBatch::Fixed(n) => n,
            IndicesPerBatch::Random { max, .. } => max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Slots in the batch ring
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    /// Defaults to `~/.pim-embedding/logs`
    pub log_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            workload: WorkloadConfig {
                nr_embedding: 8,
                nr_rows: 65_000,
                nr_cols: 16,
                nr_batches: 64,
                nr_iterations: 100,
                seed: 0,
                indices_per_batch: IndicesPerBatch::Fixed(32),
            },
            fleet: FleetLimits::default(),
            pipeline: PipelineConfig { depth: 4 },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: false,
                log_dir: None,
            },
        }
    }
}

impl RunConfig {
    /// Default configuration file path: `~/.pim-embedding/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| FleetError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".pim-embedding").join("config.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: RunConfig = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.fleet.validate()?;

        let w = &self.workload;
        if w.nr_embedding == 0 || w.nr_rows == 0 || w.nr_cols == 0 {
            return Err(FleetError::Config(
                "nr_embedding, nr_rows and nr_cols must be at least 1".into(),
            ));
        }
        if w.nr_batches == 0 || w.nr_batches > self.fleet.max_nr_batches {
            return Err(FleetError::Config(format!(
                "nr_batches must be between 1 and {}",
                self.fleet.max_nr_batches
            )));
        }
        if w.nr_rows > u32::MAX as usize {
            return Err(FleetError::Config("nr_rows must fit a 32-bit index".into()));
        }

        match w.indices_per_batch {
            IndicesPerBatch::Fixed(0) => {
                return Err(FleetError::Config("indices_per_batch must be at least 1".into()))
            }
            IndicesPerBatch::Random { min, max } if min > max => {
                return Err(FleetError::Config(format!(
                    "indices_per_batch range is empty: min {} > max {}",
                    min, max
                )))
            }
            _ => {}
        }
        if w.nr_batches * w.indices_per_batch.max() > self.fleet.max_indices {
            return Err(FleetError::Config(format!(
                "{} bags x {} indices exceed max_indices {}",
                w.nr_batches,
                w.indices_per_batch.max(),
                self.fleet.max_indices
            )));
        }

        if self.pipeline.depth < MIN_DEPTH {
            return Err(FleetError::Config(format!(
                "pipeline depth must be at least {}",
                MIN_DEPTH
            )));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(FleetError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(path = %parent.display(), error = %e, "Failed to create config directory");
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(path = %temp_path.display(), error = %e, "Failed to write temp config file");
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.depth, 4);
        assert_eq!(config.workload.indices_per_batch, IndicesPerBatch::Fixed(32));
    }

    #[test]
    fn test_depth_below_two_invalid() {
        let mut config = RunConfig::default();
        config.pipeline.depth = 1;
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn test_indices_bounds() {
        let mut config = RunConfig::default();
        config.workload.indices_per_batch = IndicesPerBatch::Random { min: 9, max: 3 };
        assert!(config.validate().is_err());

        config.workload.indices_per_batch = IndicesPerBatch::Fixed(0);
        assert!(config.validate().is_err());

        config.workload.indices_per_batch = IndicesPerBatch::Fixed(config.fleet.max_indices);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batches_over_kernel_capacity() {
        let mut config = RunConfig::default();
        config.workload.nr_batches = config.fleet.max_nr_batches + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = RunConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut original = RunConfig::default();
        original.workload.indices_per_batch = IndicesPerBatch::Random { min: 4, max: 16 };
        original.logging.log_dir = Some(temp_dir.path().join("logs"));
        original.save(&config_path).expect("save should succeed");

        let loaded = RunConfig::load(&config_path).expect("load should succeed");
        assert_eq!(original, loaded);

        // no .tmp file left behind
        assert!(!config_path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[workload]\nnr_embedding = \"many\"\n").unwrap();
        assert!(matches!(
            RunConfig::load(&config_path),
            Err(FleetError::Serialization(_))
        ));
    }

    #[test]
    fn test_default_path() {
        let path = RunConfig::default_path().unwrap();
        assert!(path.to_string_lossy().contains(".pim-embedding"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
