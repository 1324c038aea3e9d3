use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::de::DeserializeOwned;

/// Load a layered service configuration.
///
/// Sources, lowest precedence first: `defaults` (a TOML document baked into
/// the binary), an optional `configuration` file in the working directory,
/// then environment variables `<PREFIX>__SECTION__KEY`.
pub fn load<T: DeserializeOwned>(prefix: &str, defaults: &str) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::from_str(defaults, config::FileFormat::Toml))
        .add_source(File::with_name("configuration").required(false))
        .add_source(
            Environment::with_prefix(prefix)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}
