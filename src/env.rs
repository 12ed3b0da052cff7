//! Environment variable expansion for configuration files
//!
//! Credentials usually live outside the config file. A value written as
//! `${VAR}` is replaced by the variable's contents, and `${VAR:-fallback}`
//! uses `fallback` when `VAR` is unset. Commented-out YAML lines are left
//! alone, so a stale `# password: ${OLD}` does not fail the load.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;

use crate::config::ConfigError;

/// `${NAME}` or `${NAME:-fallback}`
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static pattern")
});

/// Expand every variable reference in `input`.
///
/// Fails listing all unset variables that have no fallback.
///
/// ```ignore
/// std::env::set_var("OBJSTORE_PASSWORD", "secret");
/// let out = substitute_env_vars("password: ${OBJSTORE_PASSWORD}").unwrap();
/// assert_eq!(out, "password: secret");
/// ```
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing: Vec<String> = Vec::new();

    let expanded: Vec<String> = input
        .split_inclusive('\n')
        .map(|line| {
            if line.trim_start().starts_with('#') {
                return line.to_string();
            }
            ENV_VAR_PATTERN
                .replace_all(line, |caps: &Captures| {
                    let name = &caps[1];
                    match (env::var(name), caps.get(2)) {
                        (Ok(value), _) => value,
                        (Err(_), Some(fallback)) => fallback.as_str().to_string(),
                        (Err(_), None) => {
                            if !missing.iter().any(|m| m == name) {
                                missing.push(name.to_string());
                            }
                            String::new()
                        }
                    }
                })
                .into_owned()
        })
        .collect();

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(expanded.concat())
}
