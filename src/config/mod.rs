pub mod schema;

pub use schema::{Config, GatewayConfig, MediaConfig, StorageConfig};

/// JSON schema of `config.toml`, pretty-printed.
pub fn schema_json() -> anyhow::Result<String> {
    let schema = schemars::schema_for!(Config);
    Ok(serde_json::to_string_pretty(&schema)?)
}
