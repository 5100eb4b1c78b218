//! Configuration loading.
//!
//! Three TOML sources: the application config (`config.toml`), the derived-
//! metric formula definitions, and the machine characteristics used both for
//! formula variables and for presentation scaling.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },
}

fn read<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source: Box::new(source),
    })
}

/// Top-level `config.toml` layout.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub application: AppConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read(path)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Call-path profile document to analyze.
    pub input: String,
    /// Optional second profile, rendered side by side in summary mode.
    pub comparison_input: Option<String>,
    /// Importance threshold in [0, 1]; sections strictly below it are pruned.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Thread selection, e.g. "0" or "0,2-4". Empty selects all threads.
    pub threads: Option<String>,
    /// Report whole-program information only.
    #[serde(default)]
    pub aggregate_only: bool,
    /// Emit optimization suggestions instead of the summary tables.
    #[serde(default)]
    pub recommend: bool,
    /// Cap on suggestions per code section; 0 or below means all.
    #[serde(default)]
    pub max_suggestions: i32,
    #[serde(default = "default_lcpi_path")]
    pub lcpi_config: String,
    #[serde(default = "default_machine_path")]
    pub machine_config: String,
    #[serde(default = "default_rules_path")]
    pub rules_database: String,
}

fn default_threshold() -> f64 {
    0.1
}

fn default_lcpi_path() -> String {
    "etc/lcpi.toml".to_string()
}

fn default_machine_path() -> String {
    "etc/machine.toml".to_string()
}

fn default_rules_path() -> String {
    "etc/suggestions.db".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub level_filter: Option<String>,
    pub file_output: Option<bool>,
}

/// Ordered derived-metric formula definitions. Definition order fixes the
/// dense LCPI slot mapping, so the file uses an array of tables.
#[derive(Debug, Clone, Deserialize)]
pub struct LcpiConfig {
    pub version: Option<String>,
    #[serde(default, rename = "metric")]
    pub metrics: Vec<LcpiMetric>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LcpiMetric {
    pub name: String,
    pub formula: String,
}

impl LcpiConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read(path)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.metrics.iter().position(|m| m.name == name)
    }
}

/// Machine characteristics: presentation scaling knobs plus free-form
/// numeric values formulas may reference by name.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    /// CPI at or under which a code section counts as performing well.
    #[serde(default = "default_cpi_threshold")]
    pub cpi_threshold: f64,
    /// Clock frequency in Hz, used to convert cycles to runtime.
    pub cpu_freq: f64,
    /// Expected good CPI for integer-dominated code.
    pub good_int_cpi: Option<f64>,
    /// Expected good CPI for floating-point-dominated code.
    pub good_fp_cpi: Option<f64>,
    #[serde(default)]
    pub characteristics: FxHashMap<String, f64>,
}

fn default_cpi_threshold() -> f64 {
    0.5
}

impl MachineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read(path)
    }

    /// Resolve a machine characteristic by the name formulas use.
    pub fn characteristic(&self, name: &str) -> Option<f64> {
        match name {
            "CPU_freq" => Some(self.cpu_freq),
            "CPI_threshold" => Some(self.cpi_threshold),
            _ => self.characteristics.get(name).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_config_defaults() {
        let config: ConfigFile = toml::from_str(
            r#"
            [application]
            input = "experiment.xml"
            "#,
        )
        .unwrap();
        assert_eq!(config.application.threshold, 0.1);
        assert!(!config.application.recommend);
        assert_eq!(config.application.max_suggestions, 0);
        assert_eq!(config.application.lcpi_config, "etc/lcpi.toml");
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn lcpi_metrics_preserve_definition_order() {
        let config: LcpiConfig = toml::from_str(
            r#"
            version = "1.0"

            [[metric]]
            name = "overall"
            formula = "PAPI_TOT_CYC / PAPI_TOT_INS"

            [[metric]]
            name = "data_accesses.L1d_hits"
            formula = "PAPI_L1_DCA * L1_dlat / PAPI_TOT_CYC"
            "#,
        )
        .unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config.index_of("overall"), Some(0));
        assert_eq!(config.index_of("data_accesses.L1d_hits"), Some(1));
        assert_eq!(config.index_of("missing"), None);
    }

    #[test]
    fn machine_characteristics_resolve_by_name() {
        let config: MachineConfig = toml::from_str(
            r#"
            cpu_freq = 2400000000.0
            good_int_cpi = 0.6

            [characteristics]
            L1_dlat = 3.0
            mem_lat = 200.0
            "#,
        )
        .unwrap();
        assert_eq!(config.cpi_threshold, 0.5);
        assert_eq!(config.characteristic("CPU_freq"), Some(2.4e9));
        assert_eq!(config.characteristic("CPI_threshold"), Some(0.5));
        assert_eq!(config.characteristic("L1_dlat"), Some(3.0));
        assert_eq!(config.characteristic("L2_lat"), None);
        assert_eq!(config.good_int_cpi, Some(0.6));
        assert_eq!(config.good_fp_cpi, None);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = MachineConfig::load(std::path::Path::new("/nonexistent/machine.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.toml");
        std::fs::write(&path, "cpu_freq = 1000.0\n").unwrap();
        let config = MachineConfig::load(&path).unwrap();
        assert_eq!(config.cpu_freq, 1000.0);

        std::fs::write(&path, "cpu_freq = \"not a number\"\n").unwrap();
        assert!(matches!(
            MachineConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
