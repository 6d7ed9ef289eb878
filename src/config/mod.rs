mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BusSettings, LogSettings, Settings, StoreSettings};

/// Loads the configuration from the default file and environment variables.
///
/// Environment variables use the `SESSIONBUS` prefix and `__` as the nesting
/// separator, e.g. `SESSIONBUS_BUS__MAX_PAYLOAD_SIZE=4096` or
/// `SESSIONBUS_STORE__URL=redis://127.0.0.1/`. Whatever is not
/// provided falls back to `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("SESSIONBUS")
                .prefix_separator("_")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let bus = partial.bus;
    let store = partial.store;
    let log = partial.log;

    Settings {
        bus: BusSettings {
            namespace: bus
                .as_ref()
                .and_then(|b| b.namespace.clone())
                .unwrap_or(default.bus.namespace),
            max_payload_size: bus
                .as_ref()
                .and_then(|b| b.max_payload_size)
                .unwrap_or(default.bus.max_payload_size),
            expiry_secs: bus
                .as_ref()
                .and_then(|b| b.expiry_secs)
                .unwrap_or(default.bus.expiry_secs),
            worker_token: bus
                .as_ref()
                .and_then(|b| b.worker_token.clone())
                .unwrap_or(default.bus.worker_token),
        },
        store: store.unwrap_or(default.store),
        log: LogSettings {
            level: log
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.log.level),
        },
    }
}
