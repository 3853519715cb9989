//! Process configuration.
//!
//! Credentials for the pinning backends live in a JSON config file; every
//! section is optional, and only configured backends become pin targets.
//! Column indices are assigned in declaration order here and stay stable
//! for the process lifetime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::pup::{Eternum, Pinata, PinTarget, Pipin, Pup};
use crate::shorten::Bitly;

pub const DEFAULT_IPFS_API_URL: &str = "http://127.0.0.1:5001/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {field} URL: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipinConfig {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinataConfig {
    pub api_key: String,
    pub secret_api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EternumConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitlyConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Kubo RPC API of the storage node.
    #[serde(default = "default_ipfs_api_url")]
    pub ipfs_api_url: String,

    #[serde(default)]
    pub pipin: Option<PipinConfig>,

    #[serde(default)]
    pub pinata: Option<PinataConfig>,

    #[serde(default)]
    pub eternum: Option<EternumConfig>,

    #[serde(default)]
    pub bitly: Option<BitlyConfig>,

    /// Reconciliation timer interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Drop dashboard rows once no backend lists them anymore.
    #[serde(default)]
    pub evict_unlisted: bool,
}

fn default_ipfs_api_url() -> String {
    DEFAULT_IPFS_API_URL.to_string()
}

fn default_poll_interval() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ipfs_api_url: default_ipfs_api_url(),
            pipin: None,
            pinata: None,
            eternum: None,
            bitly: None,
            poll_interval_secs: default_poll_interval(),
            evict_unlisted: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// A fully populated sample config, printed as a hint when the config
    /// file is missing. Not all entries are required.
    pub fn example() -> String {
        let sample = Config {
            ipfs_api_url: DEFAULT_IPFS_API_URL.to_string(),
            pipin: Some(PipinConfig {
                base_url: "https://pipin.example.org/".to_string(),
                token: "change-me".to_string(),
            }),
            pinata: Some(PinataConfig {
                api_key: "…".to_string(),
                secret_api_key: "…".to_string(),
            }),
            eternum: Some(EternumConfig {
                api_key: "…".to_string(),
            }),
            bitly: Some(BitlyConfig {
                api_key: "…".to_string(),
            }),
            poll_interval_secs: 60,
            evict_unlisted: false,
        };
        serde_json::to_string_pretty(&sample).expect("sample config serializes")
    }

    /// Build the configured pin targets, with stable column indices in
    /// declaration order: pipin, pinata, eternum.
    pub fn targets(&self) -> Result<Vec<PinTarget>, ConfigError> {
        let mut targets: Vec<PinTarget> = Vec::new();
        let push = |name: &str, backend: Arc<dyn Pup>, targets: &mut Vec<PinTarget>| {
            targets.push(PinTarget {
                index: targets.len(),
                name: name.to_string(),
                backend,
            });
        };

        if let Some(pipin) = &self.pipin {
            let base_url: Url =
                pipin
                    .base_url
                    .parse()
                    .map_err(|source| ConfigError::InvalidUrl {
                        field: "pipin.base_url",
                        source,
                    })?;
            push(
                "pipin",
                Arc::new(Pipin::new(base_url, pipin.token.clone())),
                &mut targets,
            );
        }
        if let Some(pinata) = &self.pinata {
            push(
                "pinata",
                Arc::new(Pinata::new(
                    pinata.api_key.clone(),
                    pinata.secret_api_key.clone(),
                )),
                &mut targets,
            );
        }
        if let Some(eternum) = &self.eternum {
            push(
                "eternum",
                Arc::new(Eternum::new(eternum.api_key.clone())),
                &mut targets,
            );
        }
        Ok(targets)
    }

    /// Kubo RPC URL, parsed.
    pub fn ipfs_api_url(&self) -> Result<Url, ConfigError> {
        self.ipfs_api_url
            .parse()
            .map_err(|source| ConfigError::InvalidUrl {
                field: "ipfs_api_url",
                source,
            })
    }

    pub fn shortener(&self) -> Option<Bitly> {
        self.bitly
            .as_ref()
            .map(|bitly| Bitly::new(bitly.api_key.clone()))
    }
}
