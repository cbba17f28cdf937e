//! Optional config file for CLI defaults.
//!
//! A flat `key = value` subset of TOML: strings in double quotes, integers,
//! `true`/`false`, and `#` comments. Unknown keys and out-of-range values are
//! rejected with the offending line number.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use climate_extract::ClientConfig;

/// Directory name under the config home.
const CONFIG_DIR: &str = "climate-extract";

/// File name inside [`CONFIG_DIR`].
const CONFIG_FILE: &str = "config.toml";

/// Values read from the config file. `None` means "keep the default".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    /// API root.
    pub base_url: Option<String>,
    /// Requests allowed per rate window.
    pub max_requests: Option<u64>,
    /// Rate window length in seconds.
    pub rate_window_secs: Option<u64>,
    /// Number of per-host pools.
    pub pool_connections: Option<u64>,
    /// Connections per host.
    pub pool_max_size: Option<u64>,
    /// Transport-level retries for allowlisted statuses.
    pub transport_retries: Option<u64>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Status-aware retries after the first attempt.
    pub max_retries: Option<u64>,
    /// Base retry delay in milliseconds.
    pub base_delay_ms: Option<u64>,
    /// Retry delay cap in seconds.
    pub max_delay_secs: Option<u64>,
    /// Randomize retry delays.
    pub jitter: Option<bool>,
    /// Largest window of a single data request, in months.
    pub max_span_months: Option<u64>,
    /// Default verbosity.
    pub verbosity: Option<VerbositySetting>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("max_requests", self.max_requests, 1..=10_000)?;
        validate_range("rate_window_secs", self.rate_window_secs, 1..=3600)?;
        validate_range("pool_connections", self.pool_connections, 1..=100)?;
        validate_range("pool_max_size", self.pool_max_size, 1..=100)?;
        validate_range("transport_retries", self.transport_retries, 0..=10)?;
        validate_range("connect_timeout_secs", self.connect_timeout_secs, 1..=3600)?;
        validate_range("read_timeout_secs", self.read_timeout_secs, 1..=3600)?;
        validate_range("max_retries", self.max_retries, 0..=10)?;
        validate_range("base_delay_ms", self.base_delay_ms, 0..=600_000)?;
        validate_range("max_delay_secs", self.max_delay_secs, 1..=3600)?;
        validate_range("max_span_months", self.max_span_months, 1..=120)?;
        if let Some(base_url) = &self.base_url
            && url::Url::parse(base_url).is_err()
        {
            bail!("Invalid config value for `base_url`: '{base_url}' is not an absolute URL");
        }
        Ok(())
    }

    /// Overlays the values present in this file onto `config`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn apply_to(&self, config: &mut ClientConfig) {
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(max_requests) = self.max_requests {
            config.rate_limit.max_requests = max_requests as usize;
        }
        if let Some(secs) = self.rate_window_secs {
            config.rate_limit.window = Duration::from_secs(secs);
        }
        if let Some(pools) = self.pool_connections {
            config.pool.pool_connections = pools as usize;
        }
        if let Some(size) = self.pool_max_size {
            config.pool.pool_max_size = size as usize;
        }
        if let Some(retries) = self.transport_retries {
            config.pool.max_retries = retries as u32;
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.pool.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.read_timeout_secs {
            config.pool.read_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = self.max_retries {
            config.retry = config.retry.clone().with_max_retries(retries as u32);
        }
        if self.base_delay_ms.is_some() || self.max_delay_secs.is_some() {
            let base = self
                .base_delay_ms
                .map_or(config.retry.base_delay(), Duration::from_millis);
            let max = self
                .max_delay_secs
                .map_or(config.retry.max_delay(), Duration::from_secs);
            config.retry = config.retry.clone().with_delays(base, max);
        }
        if let Some(jitter) = self.jitter {
            config.retry = config.retry.clone().with_jitter(jitter);
        }
        if let Some(months) = self.max_span_months {
            config.max_span_months = months as u32;
        }
    }
}

fn validate_range(
    field: &str,
    value: Option<u64>,
    range: std::ops::RangeInclusive<u64>,
) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !range.contains(&value) {
        bail!(
            "Invalid config value for `{field}`: {value}. Expected range: {}..={}",
            range.start(),
            range.end()
        );
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Log filter directive for this setting.
    #[must_use]
    pub fn filter(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose | Self::Debug => "debug",
            Self::Quiet => "error",
        }
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path, if any.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/climate-extract/config.toml`
/// 2. `$HOME/.config/climate-extract/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(CONFIG_DIR).join(CONFIG_FILE));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR)
            .join(CONFIG_FILE),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` if given (it must exist), otherwise the default path if
/// a file is present there.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(config),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "base_url" => cfg.base_url = Some(parse_string_literal(value).with_context(context)?),
            "verbosity" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.verbosity = Some(parse_verbosity(&parsed).with_context(|| {
                    format!("Invalid `verbosity` value '{parsed}' on line {line_no}")
                })?);
            }
            "jitter" => cfg.jitter = Some(parse_boolean(value).with_context(context)?),
            "max_requests" | "rate_window_secs" | "pool_connections" | "pool_max_size"
            | "transport_retries" | "connect_timeout_secs" | "read_timeout_secs"
            | "max_retries" | "base_delay_ms" | "max_delay_secs" | "max_span_months" => {
                let parsed = Some(parse_integer_u64(value).with_context(context)?);
                match key {
                    "max_requests" => cfg.max_requests = parsed,
                    "rate_window_secs" => cfg.rate_window_secs = parsed,
                    "pool_connections" => cfg.pool_connections = parsed,
                    "pool_max_size" => cfg.pool_max_size = parsed,
                    "transport_retries" => cfg.transport_retries = parsed,
                    "connect_timeout_secs" => cfg.connect_timeout_secs = parsed,
                    "read_timeout_secs" => cfg.read_timeout_secs = parsed,
                    "max_retries" => cfg.max_retries = parsed,
                    "base_delay_ms" => cfg.base_delay_ms = parsed,
                    "max_delay_secs" => cfg.max_delay_secs = parsed,
                    _ => cfg.max_span_months = parsed,
                }
            }
            "api_key" => {
                bail!(
                    "`api_key` is not read from the config file (line {line_no}); set {} instead",
                    climate_extract::extract::API_KEY_ENV
                );
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        _ => bail!("Expected one of: default, verbose, quiet, debug"),
    }
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
