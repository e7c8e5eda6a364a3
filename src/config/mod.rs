use crate::error::{Result, VigilError};
use chrono::format::{Item, StrftimeItems};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One managed app as written in a configuration file
///
/// Durations are plain milliseconds, mirroring the ecosystem-file
/// conventions of existing process managers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// App name (unique identifier)
    pub name: String,

    /// Path to the script or executable to run
    pub script: PathBuf,

    /// Command-line arguments passed after the script
    #[serde(default)]
    pub args: Vec<String>,

    /// Interpreter used to run the script (e.g. a virtualenv python)
    #[serde(default)]
    pub interpreter: Option<PathBuf>,

    /// Arguments passed to the interpreter before the script
    #[serde(default)]
    pub interpreter_args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether to restart the process when it exits
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// File-watch restarts; accepted for compatibility, must stay false
    #[serde(default)]
    pub watch: bool,

    /// Memory ceiling, either a byte count or a string such as "200M"
    #[serde(default)]
    pub max_memory_restart: Option<MemorySize>,

    /// How often to sample memory usage (ms)
    #[serde(default = "default_memory_check_interval")]
    pub memory_check_interval: u64,

    /// Cron expression for scheduled restarts
    #[serde(default)]
    pub cron_restart: Option<String>,

    /// What to do when `cron_restart` cannot be parsed
    #[serde(default)]
    pub on_invalid_cron: InvalidCronPolicy,

    /// Base delay before a restart (ms)
    #[serde(default)]
    pub restart_delay: u64,

    /// Double the restart delay after every consecutive failure
    #[serde(default)]
    pub exponential_backoff: bool,

    /// Upper bound for the exponential delay (ms)
    #[serde(default = "default_max_backoff_delay")]
    pub max_backoff_delay: u64,

    /// Give up after this many consecutive restarts (unlimited if unset)
    #[serde(default)]
    pub max_restarts: Option<usize>,

    /// Uptime after which a run counts as stable (ms)
    #[serde(default = "default_min_uptime")]
    pub min_uptime: u64,

    /// Grace period between the stop signal and SIGKILL (ms)
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: u64,

    /// Signal sent to request a graceful stop
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// File receiving the process stderr
    #[serde(default)]
    pub error_file: Option<PathBuf>,

    /// File receiving the process stdout
    #[serde(default)]
    pub out_file: Option<PathBuf>,

    /// Write stderr into `out_file` as well
    #[serde(default)]
    pub combine_logs: bool,

    /// strftime format for log line timestamps
    #[serde(default = "default_log_date_format")]
    pub log_date_format: String,
}

/// Memory amount as found in a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemorySize {
    Bytes(u64),
    Text(String),
}

impl MemorySize {
    pub fn to_bytes(&self) -> Result<u64> {
        match self {
            MemorySize::Bytes(bytes) => Ok(*bytes),
            MemorySize::Text(text) => parse_memory_size(text),
        }
    }
}

/// Policy applied when a cron expression fails to parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidCronPolicy {
    /// Refuse to start supervising the app
    #[default]
    Abort,
    /// Log a warning and supervise without scheduled restarts
    Ignore,
}

// Default value functions for serde
fn default_autorestart() -> bool {
    true
}

fn default_memory_check_interval() -> u64 {
    15_000
}

fn default_max_backoff_delay() -> u64 {
    60_000
}

fn default_min_uptime() -> u64 {
    60_000
}

fn default_kill_timeout() -> u64 {
    5_000
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_log_date_format() -> String {
    "%Y-%m-%d %H:%M:%S%.3f".to_string()
}

impl AppConfig {
    /// Create a config for `script` with every other field at its default
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            interpreter: None,
            interpreter_args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            autorestart: default_autorestart(),
            watch: false,
            max_memory_restart: None,
            memory_check_interval: default_memory_check_interval(),
            cron_restart: None,
            on_invalid_cron: InvalidCronPolicy::default(),
            restart_delay: 0,
            exponential_backoff: false,
            max_backoff_delay: default_max_backoff_delay(),
            max_restarts: None,
            min_uptime: default_min_uptime(),
            kill_timeout: default_kill_timeout(),
            stop_signal: default_stop_signal(),
            error_file: None,
            out_file: None,
            combine_logs: false,
            log_date_format: default_log_date_format(),
        }
    }

    /// Load app configurations from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Vec<AppConfig>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VigilError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let configs = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(VigilError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        let configs: Vec<AppConfig> = configs
            .into_iter()
            .map(|mut config| {
                config.expand_env_vars();
                config
            })
            .collect();

        let mut seen = HashSet::new();
        for config in &configs {
            config.validate()?;
            if !seen.insert(config.name.as_str()) {
                return Err(VigilError::ConfigValidationError(format!(
                    "Duplicate app name: {}",
                    config.name
                )));
            }
        }

        Ok(configs)
    }

    /// Parse TOML configuration, either an `apps` array or a single app
    fn parse_toml(contents: &str) -> Result<Vec<AppConfig>> {
        #[derive(Deserialize)]
        struct ConfigFile {
            #[serde(default)]
            apps: Vec<AppConfig>,
            #[serde(flatten)]
            single: Option<AppConfig>,
        }

        let config_file: ConfigFile = toml::from_str(contents)
            .map_err(|e| VigilError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

        if let Some(single) = config_file.single {
            Ok(vec![single])
        } else if !config_file.apps.is_empty() {
            Ok(config_file.apps)
        } else {
            Err(VigilError::InvalidConfig(
                "No app configuration found in file".to_string(),
            ))
        }
    }

    /// Parse JSON configuration, either `{"apps": [...]}` or a single app
    fn parse_json(contents: &str) -> Result<Vec<AppConfig>> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ConfigFile {
            Multiple { apps: Vec<AppConfig> },
            Single(AppConfig),
        }

        let config_file: ConfigFile = serde_json::from_str(contents)
            .map_err(|e| VigilError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;

        match config_file {
            ConfigFile::Single(config) => Ok(vec![config]),
            ConfigFile::Multiple { apps } => {
                if apps.is_empty() {
                    Err(VigilError::InvalidConfig(
                        "No app configuration found in file".to_string(),
                    ))
                } else {
                    Ok(apps)
                }
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VigilError::MissingConfigField("name".to_string()));
        }

        if self.script.as_os_str().is_empty() {
            return Err(VigilError::MissingConfigField("script".to_string()));
        }

        if self.watch {
            return Err(VigilError::ConfigValidationError(
                "watch is not supported".to_string(),
            ));
        }

        parse_signal(&self.stop_signal)?;

        if let Some(ref size) = self.max_memory_restart {
            if size.to_bytes()? == 0 {
                return Err(VigilError::ConfigValidationError(
                    "max_memory_restart must be greater than zero".to_string(),
                ));
            }
        }

        if self.memory_check_interval == 0 {
            return Err(VigilError::ConfigValidationError(
                "memory_check_interval must be at least 1ms".to_string(),
            ));
        }

        if self.exponential_backoff && self.max_backoff_delay < self.restart_delay {
            return Err(VigilError::ConfigValidationError(format!(
                "max_backoff_delay ({}ms) is smaller than restart_delay ({}ms)",
                self.max_backoff_delay, self.restart_delay
            )));
        }

        if StrftimeItems::new(&self.log_date_format).any(|item| matches!(item, Item::Error)) {
            return Err(VigilError::ConfigValidationError(format!(
                "Invalid log_date_format: {}",
                self.log_date_format
            )));
        }

        if let Some(ref cwd) = self.cwd {
            if !cwd.exists() {
                return Err(VigilError::ConfigValidationError(format!(
                    "Working directory does not exist: {}",
                    cwd.display()
                )));
            }
            if !cwd.is_dir() {
                return Err(VigilError::ConfigValidationError(format!(
                    "Working directory is not a directory: {}",
                    cwd.display()
                )));
            }
        }

        Ok(())
    }

    /// Expand `$VAR` and `${VAR}` references from the supervisor environment
    fn expand_env_vars(&mut self) {
        self.script = expand_env_in_path(&self.script);

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(expand_env_in_path(cwd));
        }

        self.args = self.args.iter().map(|arg| expand_env_in_string(arg)).collect();

        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();
    }
}

/// Validated, immutable runtime configuration of one managed process
#[derive(Debug, Clone)]
pub struct ManagedProcessConfig {
    pub name: String,
    /// Executable actually spawned (the interpreter when one is set)
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub autorestart: bool,
    pub memory_ceiling: Option<u64>,
    pub memory_check_interval: Duration,
    pub cron_restart: Option<String>,
    pub on_invalid_cron: InvalidCronPolicy,
    pub restart_delay: Duration,
    pub exponential_backoff: bool,
    pub max_backoff_delay: Duration,
    pub max_restarts: Option<usize>,
    pub stability_window: Duration,
    pub grace_period: Duration,
    pub stop_signal: Signal,
    pub logs: LogTargets,
}

/// Where the managed process output goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTargets {
    pub out_file: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
    pub combine: bool,
    pub date_format: String,
}

impl LogTargets {
    /// True when output should be captured instead of inherited
    pub fn captures_output(&self) -> bool {
        self.out_file.is_some() || self.error_file.is_some()
    }
}

impl TryFrom<&AppConfig> for ManagedProcessConfig {
    type Error = VigilError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        config.validate()?;

        let (program, args) = match config.interpreter {
            Some(ref interpreter) => {
                let mut args = config.interpreter_args.clone();
                args.push(config.script.to_string_lossy().into_owned());
                args.extend(config.args.iter().cloned());
                (interpreter.clone(), args)
            }
            None => (config.script.clone(), config.args.clone()),
        };

        let memory_ceiling = match config.max_memory_restart {
            Some(ref size) => Some(size.to_bytes()?),
            None => None,
        };

        Ok(Self {
            name: config.name.clone(),
            program,
            args,
            cwd: config.cwd.clone(),
            env: config.env.clone(),
            autorestart: config.autorestart,
            memory_ceiling,
            memory_check_interval: Duration::from_millis(config.memory_check_interval),
            cron_restart: config.cron_restart.clone(),
            on_invalid_cron: config.on_invalid_cron,
            restart_delay: Duration::from_millis(config.restart_delay),
            exponential_backoff: config.exponential_backoff,
            max_backoff_delay: Duration::from_millis(config.max_backoff_delay),
            max_restarts: config.max_restarts,
            stability_window: Duration::from_millis(config.min_uptime),
            grace_period: Duration::from_millis(config.kill_timeout),
            stop_signal: parse_signal(&config.stop_signal)?,
            logs: LogTargets {
                out_file: config.out_file.clone(),
                error_file: config.error_file.clone(),
                combine: config.combine_logs,
                date_format: config.log_date_format.clone(),
            },
        })
    }
}

/// Map a signal name from the config to a signal
pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(VigilError::ConfigValidationError(format!(
            "Invalid stop_signal: {}. Must be one of: SIGTERM, SIGINT, SIGQUIT, SIGKILL, SIGHUP, SIGUSR1, SIGUSR2",
            signal_name
        ))),
    }
}

/// Parse sizes such as `512`, `64K`, `200M`, `1GB` (base 1024)
pub fn parse_memory_size(text: &str) -> Result<u64> {
    let upper = text.trim().to_ascii_uppercase();
    let digits_end = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (number, suffix) = upper.split_at(digits_end);

    let invalid = || VigilError::ConfigValidationError(format!("Invalid memory size: {}", text));

    let value: u64 = number.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match suffix.trim() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => return Err(invalid()),
    };

    value.checked_mul(multiplier).ok_or_else(invalid)
}

fn expand_env_in_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => result.push_str(&value),
            _ => result.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    result.push_str(rest);
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}
