use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::constants::{GZIP_EXTENSION, OPP_EXTENSION, VCT_EXTENSION};
use super::error::{ConfigError, FilterParamError};
use super::file_id::FileId;
use super::filter::{default_bands, validate_bands, Band, FilterParams};

/// Structure representing the application configuration. Contains pathing and filtering information
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub evt_path: PathBuf,
    pub db_path: PathBuf,
    pub opp_path: Option<PathBuf>,
    pub vct_path: Option<PathBuf>,
    pub gzip_output: bool,
    pub cruise: String,
    pub param_id: Option<String>,
    pub filter: FilterParams,
    pub bands: Vec<Band>,
    pub gating_path: Option<PathBuf>,
    pub n_threads: Option<usize>,
    pub limit: Option<usize>,
    pub start_file: Option<String>,
    pub end_file: Option<String>,
    pub progress_every: f64,
    pub two_pass: bool,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be empty/invalid
    fn default() -> Self {
        Self {
            evt_path: PathBuf::from("None"),
            db_path: PathBuf::from("None"),
            opp_path: None,
            vct_path: None,
            gzip_output: true,
            cruise: String::from(""),
            param_id: None,
            filter: FilterParams::default(),
            bands: default_bands(),
            gating_path: None,
            n_threads: None,
            limit: None,
            start_file: None,
            end_file: None,
            progress_every: 10.0,
            two_pass: false,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check everything that must hold before the first file is touched
    pub fn validate(&self) -> Result<(), FilterParamError> {
        self.filter.validate()?;
        validate_bands(&self.bands)?;
        if self.n_threads == Some(0) {
            return Err(FilterParamError::BadThreadCount);
        }
        if !(self.progress_every > 0.0 && self.progress_every <= 100.0) {
            return Err(FilterParamError::BadProgressCadence(self.progress_every));
        }
        Ok(())
    }

    /// The configured parameter id, or a fingerprint of the filter parameters and bands
    pub fn get_param_id(&self) -> String {
        match &self.param_id {
            Some(id) => id.clone(),
            None => self.filter.fingerprint(&self.bands),
        }
    }

    /// Worker thread count, defaulting to the host parallelism
    pub fn get_n_threads(&self) -> usize {
        self.n_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Get the path of the OPP file for an input file, if OPP output is enabled
    pub fn get_opp_file_name(&self, id: &FileId) -> Option<PathBuf> {
        let ext = if self.gzip_output {
            format!("{OPP_EXTENSION}.{GZIP_EXTENSION}")
        } else {
            OPP_EXTENSION.to_string()
        };
        self.opp_path
            .as_ref()
            .map(|dir| dir.join(format!("{}.{ext}", id.as_str())))
    }

    /// Get the path of the VCT file for an input file, if VCT output is enabled
    pub fn get_vct_file_name(&self, id: &FileId) -> Option<PathBuf> {
        self.vct_path.as_ref().map(|dir| {
            dir.join(format!(
                "{}.{VCT_EXTENSION}.{GZIP_EXTENSION}",
                id.as_str()
            ))
        })
    }
}
