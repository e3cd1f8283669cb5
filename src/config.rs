//! YAML configuration: activation settings and PCR profiles.
//!
//! ```yaml
//! tools:
//!   systemd-cryptsetup: /lib/systemd/systemd-cryptsetup
//!   run-dir: /run
//! sealed-key:
//!   pin-tries: 3
//!   recovery-key-tries: 3
//!   activate-options: [discard]
//! recovery-key:
//!   tries: 3
//! ```

use crate::activate::{ActivateWithRecoveryKeyOptions, ActivateWithTpmSealedKeyOptions, Tools};
use crate::tpm::pcr::PcrProfile;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ActivationConfig {
    pub tools: Tools,
    pub sealed_key: ActivateWithTpmSealedKeyOptions,
    pub recovery_key: ActivateWithRecoveryKeyOptions,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            tools: Tools::default(),
            sealed_key: ActivateWithTpmSealedKeyOptions {
                pin_tries: 1,
                recovery_key_tries: 1,
                activate_options: Vec::new(),
            },
            recovery_key: ActivateWithRecoveryKeyOptions {
                tries: 1,
                activate_options: Vec::new(),
            },
        }
    }
}

impl ActivationConfig {
    /// Reads `path`, or returns the defaults if no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => load_yaml(path),
            None => Ok(Self::default()),
        }
    }
}

pub fn load_pcr_profile(path: &Path) -> Result<PcrProfile> {
    load_yaml(path)
}
