use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::command::ConverterCommand;
use crate::sweeper::RetentionWindow;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{key} must name a converter executable")]
    EmptyCommand { key: &'static str },

    #[error("retention window start hour {start} is after end hour {end}")]
    InvertedWindow { start: u32, end: u32 },
}

/// Service configuration, built once at startup and handed to every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub public_url: String,
    pub store_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub pdf_converter: ConverterCommand,
    pub fdf_converter: ConverterCommand,
    pub retention_window: RetentionWindow,
    pub sweep_interval: Duration,
    /// Files younger than this survive a sweep. `None` sweeps everything.
    pub sweep_min_age: Option<Duration>,
    /// `None` lets a converter run for as long as it likes.
    pub converter_timeout: Option<Duration>,
    pub max_batch_files: usize,
    pub purge_batch_orphans: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_or(&lookup, "PORT", "a port number", 3000u16)?;

        let start = parse_or(&lookup, "RETENTION_START_HOUR", "an hour 0-23", 8u32)?;
        let end = parse_or(&lookup, "RETENTION_END_HOUR", "an hour 0-23", 18u32)?;
        for (key, hour) in [("RETENTION_START_HOUR", start), ("RETENTION_END_HOUR", end)] {
            if hour > 23 {
                return Err(ConfigError::Invalid {
                    key,
                    expected: "an hour 0-23",
                    value: hour.to_string(),
                });
            }
        }
        let retention_window =
            RetentionWindow::new(start, end).ok_or(ConfigError::InvertedWindow { start, end })?;

        let sweep_interval = parse_or(&lookup, "SWEEP_INTERVAL_SECS", "a positive integer", 3600u64)?;
        if sweep_interval == 0 {
            return Err(ConfigError::Invalid {
                key: "SWEEP_INTERVAL_SECS",
                expected: "a positive integer",
                value: "0".to_owned(),
            });
        }

        let max_batch_files = parse_or(&lookup, "MAX_BATCH_FILES", "a positive integer", 10usize)?;
        if max_batch_files == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_BATCH_FILES",
                expected: "a positive integer",
                value: "0".to_owned(),
            });
        }

        let log_file = match lookup("LOG_FILE") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(PathBuf::from("logs.txt")),
        };

        Ok(Config {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port,
            public_url: lookup("PUBLIC_URL")
                .map(|url| url.trim_end_matches('/').to_owned())
                .unwrap_or_else(|| format!("http://localhost:{port}")),
            store_dir: PathBuf::from(lookup("STORE_DIR").unwrap_or_else(|| "uploads".to_owned())),
            log_file,
            pdf_converter: command_or(&lookup, "PDF_CONVERTER", "python3 pdf_converter.py")?,
            fdf_converter: command_or(&lookup, "FDF_CONVERTER", "python3 fdf_converter.py")?,
            retention_window,
            sweep_interval: Duration::from_secs(sweep_interval),
            sweep_min_age: parse_opt_secs(&lookup, "SWEEP_MIN_AGE_SECS")?,
            converter_timeout: parse_opt_secs(&lookup, "CONVERTER_TIMEOUT_SECS")?,
            max_batch_files,
            purge_batch_orphans: parse_or(&lookup, "PURGE_BATCH_ORPHANS", "true or false", false)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, expected: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            expected,
            value,
        }),
        None => Ok(default),
    }
}

fn parse_opt_secs<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::Invalid {
                key,
                expected: "a number of seconds",
                value,
            }),
        None => Ok(None),
    }
}

fn command_or<F>(lookup: &F, key: &'static str, default: &str) -> Result<ConverterCommand, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let line = lookup(key).unwrap_or_else(|| default.to_owned());
    ConverterCommand::parse(&line).ok_or(ConfigError::EmptyCommand { key })
}
