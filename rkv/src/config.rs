use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;

static INSTANCE: OnceCell<RuntimeConfig> = OnceCell::new();

/// Installs the process-wide configuration. Only the first call takes effect.
pub fn init(config: RuntimeConfig) -> &'static RuntimeConfig {
    INSTANCE.get_or_init(|| config)
}

pub fn instance() -> &'static RuntimeConfig {
    INSTANCE.get_or_init(RuntimeConfig::new)
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// RESP listener.
    pub addr: String,
    pub metrics_addr: String,
    /// Root of the local store.
    pub data_dir: String,
    pub snapshot_dir: String,
    pub snapshot_interval_secs: u64,
    /// Snapshot file loaded into the store before the listener opens.
    pub restore_from: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            data_dir: "data".to_string(),
            snapshot_dir: "snapshot".to_string(),
            snapshot_interval_secs: 60,
            restore_from: None,
        }
    }

    /// Loads the config at `path`. A missing or malformed file is not fatal:
    /// the node starts on the defaults.
    pub fn from_toml(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file {}, {:?}",
                    path, e
                );
                return RuntimeConfig::new();
            }
        };
        match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Something went wrong parsing the runtime config file {}, {:?}",
                    path, e
                );
                RuntimeConfig::new()
            }
        }
    }
}
