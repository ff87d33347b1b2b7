use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;

use crate::services::JwtResolverConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthzConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    /// Descriptor file (TOML, YAML or JSON).
    #[serde(default = "default_descriptors_path")]
    pub descriptors_path: String,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub jwt: Option<JwtResolverConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_descriptors_path() -> String {
    "config/descriptors.toml".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_schema() -> String {
    "public".to_string()
}

impl AuthzConfig {
    /// Optional `configuration` file overlaid with `APP__` environment
    /// variables, e.g. `APP__DATABASE__URL`.
    pub fn load() -> Result<Self, AppError> {
        core_config::load_layered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};

    #[test]
    fn test_minimal_configuration() {
        let config: AuthzConfig = Config::builder()
            .add_source(File::from_str(
                r#"
log_level = "debug"

[database]
url = "postgres://localhost/authz"
"#,
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.common.log_level, "debug");
        assert_eq!(config.descriptors_path, "config/descriptors.toml");
        let database = config.database.unwrap();
        assert_eq!(database.schema, "public");
        assert_eq!(database.max_connections, 10);
        assert!(config.jwt.is_none());
    }
}
