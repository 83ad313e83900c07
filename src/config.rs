use std::env;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for environment variable {0}")]
    Invalid(&'static str),
}

/// Postgres connection parameters, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// How many times to retry the initial connection while the database
    /// container comes up.
    pub max_connect_attempts: u32,
}

impl DbConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub listen_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            db: DbConfig {
                host: require("POSTGRES_HOST")?,
                port: parse_or("POSTGRES_PORT", 5432)?,
                user: require("POSTGRES_USER")?,
                password: require("POSTGRES_PASSWORD")?,
                database: require("POSTGRES_DB")?,
                max_connect_attempts: parse_or("MAX_DB_ATTEMPTS", 10)?,
            },
            listen_port: parse_or("PORT", 8080)?,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}
