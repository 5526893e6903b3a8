use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Settings shared by every service: listener port and deployment environment.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_port() -> u16 {
    8080
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            environment: default_environment(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Production deployments refuse to fall back to development defaults.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("prod")
            || self.environment.eq_ignore_ascii_case("production")
    }

    /// The gRPC listener sits next to the HTTP one. Port 0 stays 0 so both bind randomly.
    pub fn grpc_port(&self) -> u16 {
        if self.port == 0 { 0 } else { self.port + 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_port_follows_http_port() {
        let config = Config {
            port: 8800,
            environment: "dev".to_string(),
        };
        assert_eq!(config.grpc_port(), 8801);
    }

    #[test]
    fn random_port_stays_random() {
        let config = Config {
            port: 0,
            environment: "dev".to_string(),
        };
        assert_eq!(config.grpc_port(), 0);
    }

    #[test]
    fn production_detection_is_case_insensitive() {
        let mut config = Config::default();
        assert!(!config.is_production());
        config.environment = "PROD".to_string();
        assert!(config.is_production());
    }
}
