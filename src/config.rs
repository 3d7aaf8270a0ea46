//! Server configuration: an optional YAML file plus environment overrides.
//! Rate-limit tuning lives in [`crate::limits::RateLimitConfig::from_env`];
//! this module only covers the process-level settings.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds to
    pub bind: String,
    /// Log level filter (error, warn, info, debug, trace)
    pub log_level: String,
    /// Path of the rolling log file
    pub log_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3002".to_string(),
            log_level: "info".to_string(),
            log_path: "app.log".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from a YAML file when present, then apply environment
    /// overrides. Environment always wins over file values.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = match path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => match serde_yaml::from_str(&text) {
                    Ok(config) => config,
                    Err(err) => {
                        eprintln!("config: failed to parse {}: {}", path.display(), err);
                        Self::default()
                    }
                },
                Err(err) => {
                    eprintln!("config: failed to read {}: {}", path.display(), err);
                    Self::default()
                }
            },
            None => Self::default(),
        };

        if let Ok(bind) = std::env::var("FLOWCORE_BIND") {
            config.bind = bind;
        }
        if let Ok(level) = std::env::var("FLOWCORE_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(path) = std::env::var("FLOWCORE_LOG") {
            config.log_path = path;
        }
        config
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        match self.log_level.as_str() {
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}
