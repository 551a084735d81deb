use std::collections::HashMap;

use crate::error::ConfigError;

/// Source of configuration variables.
///
/// The process environment in production; a plain map in tests so resolution
/// never has to mutate global state.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads from `std::env`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Read a variable, treating blank values as unset.
pub(crate) fn optional_env(env: &dyn EnvSource, key: &str) -> Option<String> {
    env.var(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// First non-blank value among `keys` (primary name first, then aliases).
pub(crate) fn optional_env_any(env: &dyn EnvSource, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| optional_env(env, key))
}

pub(crate) fn require_env_any(
    env: &dyn EnvSource,
    keys: &[&str],
    hint: &str,
) -> Result<String, ConfigError> {
    optional_env_any(env, keys).ok_or_else(|| ConfigError::MissingRequired {
        key: keys.first().copied().unwrap_or_default().to_string(),
        hint: hint.to_string(),
    })
}

pub(crate) fn parse_string_env(env: &dyn EnvSource, key: &str, default: &str) -> String {
    optional_env(env, key).unwrap_or_else(|| default.to_string())
}

pub(crate) fn parse_bool_env(
    env: &dyn EnvSource,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match optional_env(env, key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{other}'"),
            }),
        },
    }
}

pub(crate) fn parse_usize_env(
    env: &dyn EnvSource,
    key: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match optional_env(env, key) {
        None => Ok(default),
        Some(raw) => raw.parse::<usize>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}
