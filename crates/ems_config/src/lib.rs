pub mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::settings::PartialSettings;

pub use settings::{
    AuthSettings, ClientSettings, LookupSettings, QueueSettings, ScanSettings, ServerSettings,
    Settings, TlsSettings,
};

/// Load settings from `config/default.{toml,json,...}` (optional) and the
/// environment, merged over the built-in defaults.
///
/// Environment variables use `_` as the section separator, e.g.
/// `SERVER_TCP_ADDRESS=0.0.0.0:4150`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("_"));

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::default().merged(partial))
}

#[cfg(test)]
mod tests;
