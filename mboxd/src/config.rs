use std::io::Read;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DaemonConfig {
    pub pid: Option<String>,
    pub accounts: Vec<AccountEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccountEntry {
    pub name: String,

    #[serde(flatten)]
    pub storage: StorageBackend,
}

/// Only the in-memory adapter ships today; a networked permanent store
/// plugs in here as a second variant without touching callers.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "storage_driver")]
pub enum StorageBackend {
    InMemory,
}

pub fn read_config(config_file: PathBuf) -> Result<DaemonConfig> {
    let mut file = std::fs::OpenOptions::new().read(true).open(&config_file)?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}
