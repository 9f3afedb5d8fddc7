//! Ordered environment variable handling.
//!
//! Job env vars arrive base64-encoded from the control plane; host-level
//! env vars are configured in plain text and win on name collisions. Keys
//! are unique and always iterated in sorted order, so `.env` dumps are
//! deterministic.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::EnvVar;

/// A plain-text env var configured on the host, as opposed to the
/// base64-encoded ones in a job request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostEnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("env var {0} is not valid base64: {1}")]
    InvalidBase64(String, base64::DecodeError),

    #[error("env var {0} is not valid UTF-8")]
    InvalidUtf8(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    /// Build an environment from a job request's base64-encoded vars plus
    /// the host-configured plain ones. Host vars overwrite request vars.
    pub fn create(env_vars: &[EnvVar], host_env_vars: &[HostEnvVar]) -> Result<Self, EnvError> {
        let mut env = Environment::new();

        for var in env_vars {
            let decoded = BASE64
                .decode(&var.value)
                .map_err(|e| EnvError::InvalidBase64(var.name.clone(), e))?;
            let value = String::from_utf8(decoded)
                .map_err(|_| EnvError::InvalidUtf8(var.name.clone()))?;
            env.set(&var.name, &value);
        }

        for var in host_env_vars {
            env.set(&var.name, &var.value);
        }

        Ok(env)
    }

    /// Parse a previously dumped env file of `K=V` lines. Blank lines are
    /// skipped; leading `export ` prefixes and single-quoting are undone.
    pub fn from_file(path: &Path) -> Result<Self, EnvError> {
        let content = std::fs::read_to_string(path)?;
        let mut env = Environment::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((name, value)) = line.split_once('=') {
                env.set(name, unquote(value));
            }
        }

        Ok(env)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Merge `other` into `self`, overwriting existing keys. `on_append`
    /// is invoked for every key taken from `other`, in sorted order.
    pub fn append<F>(&mut self, other: &Environment, mut on_append: F)
    where
        F: FnMut(&str, &str),
    {
        for (name, value) in &other.vars {
            self.vars.insert(name.clone(), value.clone());
            on_append(name, value);
        }
    }

    /// Sorted `K=V` pairs, suitable for handing to a child process.
    pub fn to_slice(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect()
    }

    /// Dump the environment as a sourceable file of `export K=V` lines.
    /// Values are single-quoted unless purely alphanumeric. `on_export`
    /// is invoked per var, in sorted order.
    pub fn to_file<F>(&self, path: &Path, mut on_export: Option<F>) -> Result<(), EnvError>
    where
        F: FnMut(&str),
    {
        let mut file = std::fs::File::create(path)?;

        for (name, value) in &self.vars {
            if let Some(callback) = on_export.as_mut() {
                callback(name);
            }
            writeln!(file, "export {}={}", name, quote(value))?;
        }

        Ok(())
    }
}

/// Quote a value for a POSIX `export` line. Alphanumeric values pass
/// through bare; everything else is single-quoted with embedded quotes
/// escaped via the `'\''` idiom.
fn quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric()) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &str) -> String {
        BASE64.encode(value.as_bytes())
    }

    fn assert_value(env: &Environment, key: &str, expected: &str) {
        assert_eq!(env.get(key), Some(expected), "key {key}");
    }

    #[test]
    fn request_vars_are_base64_decoded() {
        let vars = vec![
            EnvVar { name: "A".into(), value: encoded("AAA") },
            EnvVar { name: "B".into(), value: encoded("BBB") },
        ];

        let env = Environment::create(&vars, &[]).unwrap();
        assert_value(&env, "A", "AAA");
        assert_value(&env, "B", "BBB");
    }

    #[test]
    fn host_vars_are_not_decoded() {
        let host = vec![
            HostEnvVar { name: "A".into(), value: "AAA".into() },
            HostEnvVar { name: "B".into(), value: "BBB".into() },
        ];

        let env = Environment::create(&[], &host).unwrap();
        assert_value(&env, "A", "AAA");
        assert_value(&env, "B", "BBB");
    }

    #[test]
    fn badly_encoded_request_var_is_an_error() {
        let vars = vec![EnvVar { name: "A".into(), value: "AAA".into() }];
        assert!(Environment::create(&vars, &[]).is_err());
    }

    #[test]
    fn later_request_var_overwrites_earlier_one() {
        let vars = vec![
            EnvVar { name: "FOO".into(), value: encoded("FOO") },
            EnvVar { name: "FOO".into(), value: encoded("BAR") },
        ];

        let env = Environment::create(&vars, &[]).unwrap();
        assert_value(&env, "FOO", "BAR");
    }

    #[test]
    fn host_var_overwrites_request_var() {
        let vars = vec![EnvVar { name: "FOO".into(), value: encoded("BAR") }];
        let host = vec![HostEnvVar { name: "FOO".into(), value: "AAA".into() }];

        let env = Environment::create(&vars, &host).unwrap();
        assert_value(&env, "FOO", "AAA");
    }

    #[test]
    fn from_file_parses_dumped_vars() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "\nVAR_A=AAA\nVAR_B=BBB\nVAR_C=CCC\n").unwrap();

        let env = Environment::from_file(file.path()).unwrap();
        assert_eq!(env.keys(), vec!["VAR_A", "VAR_B", "VAR_C"]);
        assert_value(&env, "VAR_A", "AAA");
        assert_value(&env, "VAR_B", "BBB");
        assert_value(&env, "VAR_C", "CCC");
    }

    #[test]
    fn to_file_sorts_and_quotes() {
        let vars = vec![
            EnvVar { name: "Z".into(), value: encoded("ZZZ") },
            EnvVar { name: "O".into(), value: encoded("OOO") },
            EnvVar { name: "QUOTED".into(), value: encoded("This is going to get quoted") },
        ];

        let env = Environment::create(&vars, &[]).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        env.to_file(file.path(), None::<fn(&str)>).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(
            content,
            "export O=OOO\nexport QUOTED='This is going to get quoted'\nexport Z=ZZZ\n"
        );
    }

    #[test]
    fn to_file_escapes_embedded_single_quotes() {
        let mut env = Environment::new();
        env.set("A", "it's");

        let file = tempfile::NamedTempFile::new().unwrap();
        env.to_file(file.path(), None::<fn(&str)>).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "export A='it'\\''s'\n");
    }

    #[test]
    fn to_slice_contains_all_pairs() {
        let vars = vec![
            EnvVar { name: "A".into(), value: encoded("AAA") },
            EnvVar { name: "B".into(), value: encoded("BBB") },
            EnvVar { name: "C".into(), value: encoded("CCC") },
        ];

        let env = Environment::create(&vars, &[]).unwrap();
        let slice = env.to_slice();
        assert!(slice.contains(&"A=AAA".to_string()));
        assert!(slice.contains(&"B=BBB".to_string()));
        assert!(slice.contains(&"C=CCC".to_string()));
    }

    #[test]
    fn append_reports_touched_keys_in_sorted_order() {
        let vars = vec![
            EnvVar { name: "C".into(), value: encoded("CCC") },
            EnvVar { name: "D".into(), value: encoded("DDD") },
            EnvVar { name: "A".into(), value: encoded("AAA") },
        ];
        let other = Environment::create(&vars, &[]).unwrap();

        let mut appended = Vec::new();
        let mut first = Environment::new();
        first.append(&other, |name, _| appended.push(name.to_string()));

        assert_eq!(appended, vec!["A", "C", "D"]);
        assert_value(&first, "A", "AAA");
        assert_value(&first, "C", "CCC");
        assert_value(&first, "D", "DDD");
    }
}
