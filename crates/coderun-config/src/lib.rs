use coderun_protocol::Language;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_CODERUN_CONFIG: &str = "CODERUN_CONFIG";

const DEFAULT_POOL_BUFFER_SIZE: usize = 2;
const MAX_POOL_BUFFER_SIZE: usize = 16;
const DEFAULT_REFILL_ATTEMPTS: usize = 2;
const DEFAULT_HALT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 1000;
const DEFAULT_PYTHON_BINARY: &str = "python3";
const DEFAULT_SCHEME_BINARY: &str = "scheme";
const DEFAULT_SQLITE_BINARY: &str = "sqlite3";

/// Reads one JSON-encoded source line from stdin and executes it, leaving
/// stdin free for the program's own `input()` calls.
const PYTHON_DRIVER: &str = "import json, sys\n\
source = json.loads(sys.stdin.readline())\n\
exec(compile(source, '<input>', 'exec'), {'__name__': '__main__'})\n";

const LARK_DRIVER: &str = "import json, sys\n\
from lark import Lark\n\
source = json.loads(sys.stdin.readline())\n\
exec(compile(source, '<input>', 'exec'), {'__name__': '__main__', 'Lark': Lark})\n";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CoderunConfig {
    #[serde(default)]
    pub pool: PoolConfigToml,
    #[serde(default)]
    pub client: ClientConfigToml,
    #[serde(default)]
    pub languages: LanguagesConfigToml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfigToml {
    #[serde(default = "default_pool_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_refill_attempts")]
    pub refill_attempts: usize,
}

impl Default for PoolConfigToml {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_POOL_BUFFER_SIZE,
            refill_attempts: DEFAULT_REFILL_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfigToml {
    /// `0` disables the watchdog.
    #[serde(default = "default_halt_timeout_secs")]
    pub halt_timeout_secs: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
}

impl Default for ClientConfigToml {
    fn default() -> Self {
        Self {
            halt_timeout_secs: DEFAULT_HALT_TIMEOUT_SECS,
            watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FramingToml {
    #[default]
    JsonLine,
    RawLine,
    RawThenClose,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LanguageConfigToml {
    pub program: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub framing: FramingToml,
    pub enabled: bool,
    pub environment: BTreeMap<String, String>,
}

impl LanguageConfigToml {
    fn command(program: &str, args: &[&str], framing: FramingToml) -> Self {
        Self {
            program: program.to_owned(),
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
            working_dir: None,
            framing,
            enabled: true,
            environment: BTreeMap::new(),
        }
    }
}

/// Each `[languages.<name>]` table is read as an overlay: keys it leaves out
/// keep that language's own default, not a type-level one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "LanguageOverridesToml")]
pub struct LanguagesConfigToml {
    pub python: LanguageConfigToml,
    pub scheme: LanguageConfigToml,
    pub sql: LanguageConfigToml,
    pub lark: LanguageConfigToml,
}

#[derive(Debug, Default, Deserialize)]
struct LanguageOverridesToml {
    python: Option<LanguageOverrideToml>,
    scheme: Option<LanguageOverrideToml>,
    sql: Option<LanguageOverrideToml>,
    lark: Option<LanguageOverrideToml>,
}

#[derive(Debug, Default, Deserialize)]
struct LanguageOverrideToml {
    program: Option<String>,
    args: Option<Vec<String>>,
    working_dir: Option<String>,
    framing: Option<FramingToml>,
    enabled: Option<bool>,
    environment: Option<BTreeMap<String, String>>,
}

impl LanguageOverrideToml {
    fn overlay(self, mut base: LanguageConfigToml) -> LanguageConfigToml {
        if let Some(program) = self.program {
            base.program = program;
        }
        if let Some(args) = self.args {
            base.args = args;
        }
        if self.working_dir.is_some() {
            base.working_dir = self.working_dir;
        }
        if let Some(framing) = self.framing {
            base.framing = framing;
        }
        if let Some(enabled) = self.enabled {
            base.enabled = enabled;
        }
        if let Some(environment) = self.environment {
            base.environment = environment;
        }
        base
    }
}

impl From<LanguageOverridesToml> for LanguagesConfigToml {
    fn from(overrides: LanguageOverridesToml) -> Self {
        Self {
            python: overrides
                .python
                .unwrap_or_default()
                .overlay(default_python_config()),
            scheme: overrides
                .scheme
                .unwrap_or_default()
                .overlay(default_scheme_config()),
            sql: overrides.sql.unwrap_or_default().overlay(default_sql_config()),
            lark: overrides.lark.unwrap_or_default().overlay(default_lark_config()),
        }
    }
}

impl Default for LanguagesConfigToml {
    fn default() -> Self {
        Self {
            python: default_python_config(),
            scheme: default_scheme_config(),
            sql: default_sql_config(),
            lark: default_lark_config(),
        }
    }
}

impl LanguagesConfigToml {
    pub fn get(&self, language: Language) -> &LanguageConfigToml {
        match language {
            Language::Python => &self.python,
            Language::Scheme => &self.scheme,
            Language::Sql => &self.sql,
            Language::Lark => &self.lark,
        }
    }

    /// Enabled languages with their settings, in declaration order.
    pub fn enabled(&self) -> Vec<(Language, &LanguageConfigToml)> {
        Language::ALL
            .iter()
            .map(|language| (*language, self.get(*language)))
            .filter(|(_, config)| config.enabled)
            .collect()
    }
}

impl CoderunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.buffer_size > MAX_POOL_BUFFER_SIZE {
            return Err(ConfigError::configuration(format!(
                "pool.buffer_size must be at most {MAX_POOL_BUFFER_SIZE}, got {}",
                self.pool.buffer_size
            )));
        }
        if self.pool.refill_attempts == 0 {
            return Err(ConfigError::configuration(
                "pool.refill_attempts must be at least 1",
            ));
        }
        if self.client.watchdog_interval_ms == 0 {
            return Err(ConfigError::configuration(
                "client.watchdog_interval_ms must be greater than 0",
            ));
        }
        for language in Language::ALL {
            let config = self.languages.get(language);
            if config.enabled && config.program.trim().is_empty() {
                return Err(ConfigError::configuration(format!(
                    "languages.{language}.program must not be empty"
                )));
            }
        }
        Ok(())
    }
}

pub fn load_from_env() -> Result<CoderunConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<CoderunConfig, ConfigError> {
    let config = load_or_create_config(path.as_ref())?;
    config.validate()?;
    Ok(config)
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = non_blank_env_path("HOME")
        .or_else(|| non_blank_env_path("USERPROFILE"))
        .ok_or_else(|| {
            ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
        })?;
    Ok(home.join(".config").join("coderun").join("config.toml"))
}

/// `CODERUN_CONFIG` wins unless it is unset or blank.
fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_CODERUN_CONFIG) {
        Ok(raw) if !raw.trim().is_empty() => Ok(raw.into()),
        Ok(_) | Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::configuration(
            "CODERUN_CONFIG contained invalid UTF-8",
        )),
    }
}

fn non_blank_env_path(name: &str) -> Option<PathBuf> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

fn default_pool_buffer_size() -> usize {
    DEFAULT_POOL_BUFFER_SIZE
}

fn default_refill_attempts() -> usize {
    DEFAULT_REFILL_ATTEMPTS
}

fn default_halt_timeout_secs() -> u64 {
    DEFAULT_HALT_TIMEOUT_SECS
}

fn default_watchdog_interval_ms() -> u64 {
    DEFAULT_WATCHDOG_INTERVAL_MS
}

fn default_python_config() -> LanguageConfigToml {
    LanguageConfigToml::command(
        DEFAULT_PYTHON_BINARY,
        &["-u", "-c", PYTHON_DRIVER],
        FramingToml::JsonLine,
    )
}

fn default_lark_config() -> LanguageConfigToml {
    LanguageConfigToml::command(
        DEFAULT_PYTHON_BINARY,
        &["-u", "-c", LARK_DRIVER],
        FramingToml::JsonLine,
    )
}

fn default_scheme_config() -> LanguageConfigToml {
    LanguageConfigToml::command(DEFAULT_SCHEME_BINARY, &["--quiet"], FramingToml::RawThenClose)
}

fn default_sql_config() -> LanguageConfigToml {
    LanguageConfigToml::command(DEFAULT_SQLITE_BINARY, &["-batch"], FramingToml::RawThenClose)
}

fn load_or_create_config(path: &Path) -> Result<CoderunConfig, ConfigError> {
    let failed = |action: &str, err: &dyn std::fmt::Display| {
        ConfigError::configuration(format!(
            "Failed to {action} CODERUN_CONFIG {}: {err}",
            path.display()
        ))
    };

    match std::fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw).map_err(|err| failed("parse", &err)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let config = CoderunConfig::default();
            let rendered =
                toml::to_string_pretty(&config).map_err(|err| failed("serialize", &err))?;
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|err| failed("create parent of", &err))?;
            }
            std::fs::write(path, rendered).map_err(|err| failed("write", &err))?;
            Ok(config)
        }
        Err(err) => Err(failed("read", &err)),
    }
}
