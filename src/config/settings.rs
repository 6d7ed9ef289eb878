use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the bus itself, the store it runs on, and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub bus: BusSettings,
    pub store: StoreSettings,
    pub log: LogSettings,
}

/// Configuration settings for a bus instance.
///
/// `max_payload_size` bounds both message names and inline envelope bodies.
/// `expiry_secs` is the idle window applied to session records, traffic
/// markers and attachments.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BusSettings {
    pub namespace: String,
    pub max_payload_size: usize,
    pub expiry_secs: u64,
    pub worker_token: String,
}

impl BusSettings {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

/// Where the shared store lives.
///
/// `url` is a `redis://` connection string. Without one the process runs on
/// an in-process store and cannot share a bus with other processes.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct StoreSettings {
    pub url: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub bus: Option<PartialBusSettings>,
    pub store: Option<StoreSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBusSettings {
    pub namespace: Option<String>,
    pub max_payload_size: Option<usize>,
    pub expiry_secs: Option<u64>,
    pub worker_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            namespace: "sessionbus".to_string(),
            max_payload_size: 1024,
            expiry_secs: 3600,
            worker_token: "worker".to_string(),
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            bus: BusSettings::default(),
            store: StoreSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
