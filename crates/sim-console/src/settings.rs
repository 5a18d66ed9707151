//! Client settings: where the service lives, how to poll it, how to log.
//!
//! Read from an optional TOML file. A file may name a single parent with
//! `extends = "base.toml"` (relative to itself); tables are deep-merged with
//! the child winning.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use toml::Value;

use crate::error::{Error, Result};
use crate::poll::PollOptions;

pub const DEFAULT_SETTINGS_FILE: &str = "sim-console.toml";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSettings {
    pub base_url: String,
    pub base_url_env: String,
    pub timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            base_url_env: "SIMULATION_HOST".into(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollSettings {
    pub interval_ms: u64,
    /// 0 = one per CPU.
    pub fetch_parallelism: usize,
    pub max_consecutive_failures: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            fetch_parallelism: 0,
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    pub filter: String,
    pub json: bool,
    pub file: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            json: false,
            file: PathBuf::from("sim-console.log"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub service: ServiceSettings,
    pub poll: PollSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Load `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let value = load_value(path)?;
        value
            .try_into()
            .map_err(|e| Error::msg(format!("invalid settings in {}: {e}", path.display())))
    }

    /// Base URL after applying the env override and an explicit override
    /// (highest precedence).
    pub fn base_url(&self, explicit: Option<&str>) -> Result<String> {
        let from_env = std::env::var(&self.service.base_url_env)
            .ok()
            .filter(|v| !v.trim().is_empty());
        let url = explicit
            .map(str::to_string)
            .or(from_env)
            .unwrap_or_else(|| self.service.base_url.clone());
        check_base_url(&url)?;
        Ok(url.trim().to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.service.timeout_secs.max(1))
    }

    pub fn poll_options(&self) -> PollOptions {
        let parallelism = match self.poll.fetch_parallelism {
            0 => num_cpus::get().max(1),
            n => n,
        };
        PollOptions {
            interval: Duration::from_millis(self.poll.interval_ms),
            parallelism,
            max_consecutive_failures: self.poll.max_consecutive_failures.max(1),
        }
    }
}

fn check_base_url(url: &str) -> Result<()> {
    let url = url.trim();
    if url.is_empty() {
        return Err(Error::msg("service base URL is empty"));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::msg(format!(
            "service base URL '{url}' must start with http:// or https://"
        )));
    }
    Ok(())
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn parent_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_chain(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "settings extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read settings {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let parent = match value.as_table_mut().and_then(|t| t.remove("extends")) {
        Some(Value::String(p)) => Some(p),
        Some(_) => {
            return Err(Error::msg(format!(
                "'extends' in {} must be a string",
                path.display()
            )));
        }
        None => None,
    };

    let mut out = match parent {
        Some(p) => load_chain(&parent_path(path, &p), seen)?,
        None => Value::Table(Default::default()),
    };
    merge_values(&mut out, value);
    Ok(out)
}

/// The fully merged TOML for `path`.
pub fn load_value(path: &Path) -> Result<Value> {
    load_chain(path, &mut HashSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn missing_file_gives_defaults() {
        let td = tempfile::tempdir().unwrap();
        let s = Settings::load(&td.path().join("nope.toml")).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.poll_options().max_consecutive_failures, 5);
    }

    #[test]
    fn extends_merges_child_over_parent() {
        let td = tempfile::tempdir().unwrap();
        write(
            td.path(),
            "base.toml",
            "[service]\nbase_url = \"http://base:1\"\ntimeout_secs = 5\n[poll]\ninterval_ms = 250\n",
        );
        let child = write(
            td.path(),
            "child.toml",
            "extends = \"base.toml\"\n[service]\nbase_url = \"https://child:2\"\n",
        );
        let s = Settings::load(&child).unwrap();
        assert_eq!(s.service.base_url, "https://child:2");
        assert_eq!(s.service.timeout_secs, 5);
        assert_eq!(s.poll.interval_ms, 250);
        assert_eq!(s.log, LogSettings::default());
    }

    #[test]
    fn extends_cycle_is_rejected() {
        let td = tempfile::tempdir().unwrap();
        write(td.path(), "a.toml", "extends = \"b.toml\"\n");
        let b = write(td.path(), "b.toml", "extends = \"a.toml\"\n");
        let err = Settings::load(&b).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let td = tempfile::tempdir().unwrap();
        let p = write(td.path(), "s.toml", "[poll]\nintervall_ms = 5\n");
        assert!(Settings::load(&p).is_err());
    }

    #[test]
    fn base_url_precedence_and_checks() {
        let mut s = Settings::default();
        s.service.base_url_env = "SIM_CONSOLE_TEST_UNSET_VAR".into();
        assert_eq!(s.base_url(None).unwrap(), DEFAULT_BASE_URL);
        assert_eq!(
            s.base_url(Some("https://override")).unwrap(),
            "https://override"
        );
        assert!(s.base_url(Some("ftp://x")).is_err());
        assert!(s.base_url(Some("  ")).is_err());
    }

    #[test]
    fn zero_parallelism_means_cpu_count() {
        let s = Settings::default();
        assert_eq!(s.poll_options().parallelism, num_cpus::get().max(1));
    }
}
