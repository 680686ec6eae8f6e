use std::path::Path;

use tracing::{info, warn};

use crate::error::AppError;

const DEFAULT_DATABASE_URL: &str = "sqlite://classroom.db";
const DEFAULT_SESSION_HOURS: i64 = 1;
const DEFAULT_SESSION_CLEANUP_SECS: u64 = 3600;

pub fn load_environment() -> Result<(), Box<dyn std::error::Error>> {
    let is_production =
        dotenvy::var("ROCKET_PROFILE").unwrap_or("development".to_string()) == "production";

    let env_files = if is_production {
        vec!["config/common.env", "config/prod.env", ".secrets.env"]
    } else {
        vec!["config/common.env", "config/dev.env", ".secrets.env"]
    };

    for env_file in env_files {
        load_env_file(env_file)?;
    }

    Ok(())
}

fn load_env_file(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !Path::new(path).exists() {
        warn!("Warning: Environment file {} not found, skipping", path);
        return Ok(());
    }

    dotenvy::from_filename_override(path)?;
    info!("Loaded environment from: {}", path);
    Ok(())
}

/// Runtime settings read from the process environment after the env files
/// have been layered in.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: String,
    pub session_hours: i64,
    pub session_cleanup_secs: u64,
    pub honeycomb_api_key: Option<String>,
    pub deployment_env: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            session_hours: DEFAULT_SESSION_HOURS,
            session_cleanup_secs: DEFAULT_SESSION_CLEANUP_SECS,
            honeycomb_api_key: None,
            deployment_env: "develop".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let database_url = non_empty_var("DATABASE_URL").unwrap_or(defaults.database_url);

        let session_hours = match non_empty_var("SESSION_HOURS") {
            Some(raw) => parse_positive("SESSION_HOURS", &raw)?,
            None => defaults.session_hours,
        };

        let session_cleanup_secs = match non_empty_var("SESSION_CLEANUP_SECS") {
            Some(raw) => parse_positive("SESSION_CLEANUP_SECS", &raw)?,
            None => defaults.session_cleanup_secs,
        };

        Ok(Self {
            database_url,
            session_hours,
            session_cleanup_secs,
            honeycomb_api_key: non_empty_var("HONEYCOMB_API_KEY"),
            deployment_env: non_empty_var("DEPLOYMENT_ENV").unwrap_or(defaults.deployment_env),
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    dotenvy::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_positive<T>(key: &str, raw: &str) -> Result<T, AppError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(AppError::Validation(format!(
            "{} must be a positive integer, got '{}'",
            key, raw
        ))),
    }
}

#[cfg(test)]
pub fn load_test_environment() -> Result<(), Box<dyn std::error::Error>> {
    let test_env_files = vec!["config/common.env", ".secrets.env"];

    for env_file in test_env_files {
        load_env_file(env_file)?;
    }

    Ok(())
}
