mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, LogSettings, MIN_PERIOD, NodeSettings, Settings, period_for_rate,
};

/// Prefix of environment variables read by [`load_config`], e.g.
/// `POPMESH__BROKER__PORT`.
pub const ENV_PREFIX: &str = "POPMESH";

/// Loads the configuration from the default file and environment variables.
///
/// A `.env` file in the working directory is applied to the process
/// environment first. Values missing from every source fall back to
/// `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file stem, without `.env`.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
