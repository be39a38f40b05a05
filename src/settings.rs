use std::sync::Mutex;

use config::{Config, ConfigError, Environment, File};
use lazy_static::lazy_static;
use serde::Deserialize;

lazy_static! {
    pub static ref SETTINGS: Mutex<Settings> =
        Mutex::new(Settings::new().expect("invalid configuration"));
}

const SETTINGS_PATH: &str = "./rust-fil-proofs.config.toml";

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Benchmark mode: every file write becomes a no-op while queue flow is
    /// unchanged.
    pub pc2_disable_file_writes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            pc2_disable_file_writes: false,
        }
    }
}

impl Settings {
    fn new() -> Result<Settings, ConfigError> {
        let mut s = Config::new();

        s.merge(File::with_name(SETTINGS_PATH).required(false))?;

        // Override values from the environment (with prefix "FIL_PROOFS"),
        // e.g. `FIL_PROOFS_PC2_DISABLE_FILE_WRITES=1`.
        s.merge(Environment::with_prefix("FIL_PROOFS"))?;

        s.try_into()
    }
}

pub fn file_writes_enabled() -> bool {
    !SETTINGS
        .lock()
        .expect("pc2 settings lock failure")
        .pc2_disable_file_writes
}
