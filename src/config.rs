//! Runner configuration.
//!
//! Configuration is resolved with the following priority (highest to lowest):
//! 1. Builder-style setters
//! 2. Environment variables (see [`RunnerConfig::apply_env`])
//! 3. Configuration file (JSON)
//! 4. Default values

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// What a runner does with a failure once the channel and session have been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Hand the error back to the caller.
    Propagate,
    /// Log the error and return an empty [`Outcome`](crate::Outcome) instead.
    BestEffort,
}

/// Tuning shared by every session and channel a [`SshRunner`](crate::SshRunner) opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Interval between keep-alive probes, in milliseconds.
    pub keep_alive_interval_ms: u64,
    /// Keep-alive probes that may go unanswered before the connection is dropped.
    pub keep_alive_max_missed: u32,
    /// Pseudo-terminal type requested for shell channels. `None` runs the shell without one.
    pub pty_type: Option<String>,
    /// Session timeout in milliseconds. Only the initial connection honours it.
    pub session_timeout_ms: u64,
    /// Echo channel output to the log as it arrives.
    pub verbose: bool,
    /// Drain shell channels until they close instead of giving up after `max_wait_secs`.
    pub ignore_timeout: bool,
    /// Upper bound on how long a shell run collects output when `ignore_timeout` is off.
    pub max_wait_secs: u64,
    /// Private key used as the only identity.
    pub pem_file: Option<PathBuf>,
    /// Where the per-session control directories are created.
    pub control_dir: Option<PathBuf>,
    /// Error handling of exec runs.
    pub exec_errors: ErrorPolicy,
    /// Error handling of shell runs.
    pub shell_errors: ErrorPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: 120 * 1000,
            keep_alive_max_missed: 1000,
            pty_type: Some("dumb".to_owned()),
            session_timeout_ms: 100_000,
            verbose: true,
            ignore_timeout: false,
            max_wait_secs: 10,
            pem_file: None,
            control_dir: None,
            exec_errors: ErrorPolicy::BestEffort,
            shell_errors: ErrorPolicy::Propagate,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a JSON file. Missing fields take their default value.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    ///
    /// Recognised: `SSH_RUNNER_PEM_FILE`, `SSH_RUNNER_PTY_TYPE`, `SSH_RUNNER_MAX_WAIT_SECS`,
    /// `SSH_RUNNER_IGNORE_TIMEOUT` and `SSH_RUNNER_VERBOSE`. Values that do not parse are
    /// skipped with a warning.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(pem) = var("SSH_RUNNER_PEM_FILE") {
            self.pem_file = Some(PathBuf::from(pem));
        }
        if let Some(pty) = var("SSH_RUNNER_PTY_TYPE") {
            self.pty_type = if pty.is_empty() { None } else { Some(pty) };
        }
        if let Some(secs) = var("SSH_RUNNER_MAX_WAIT_SECS") {
            match secs.parse() {
                Ok(secs) => self.max_wait_secs = secs,
                Err(_) => tracing::warn!(value = %secs, "ignoring invalid SSH_RUNNER_MAX_WAIT_SECS"),
            }
        }
        if let Some(flag) = var("SSH_RUNNER_IGNORE_TIMEOUT") {
            match parse_bool(&flag) {
                Some(flag) => self.ignore_timeout = flag,
                None => tracing::warn!(value = %flag, "ignoring invalid SSH_RUNNER_IGNORE_TIMEOUT"),
            }
        }
        if let Some(flag) = var("SSH_RUNNER_VERBOSE") {
            match parse_bool(&flag) {
                Some(flag) => self.verbose = flag,
                None => tracing::warn!(value = %flag, "ignoring invalid SSH_RUNNER_VERBOSE"),
            }
        }
    }

    /// Set the keep-alive interval.
    pub fn keep_alive_interval(&mut self, d: Duration) -> &mut Self {
        self.keep_alive_interval_ms = millis(d);
        self
    }

    /// Set how many keep-alive probes may be missed.
    pub fn keep_alive_max_missed(&mut self, count: u32) -> &mut Self {
        self.keep_alive_max_missed = count;
        self
    }

    /// Set the pseudo-terminal type of shell channels, or `None` for no pseudo-terminal.
    pub fn pty_type(&mut self, pty: Option<&str>) -> &mut Self {
        self.pty_type = pty.map(str::to_owned);
        self
    }

    /// Set the session timeout.
    pub fn session_timeout(&mut self, d: Duration) -> &mut Self {
        self.session_timeout_ms = millis(d);
        self
    }

    /// Echo channel output to the log.
    pub fn verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Select unbounded-drain (`true`) or bounded-wait (`false`) collection for shell runs.
    pub fn ignore_timeout(&mut self, ignore: bool) -> &mut Self {
        self.ignore_timeout = ignore;
        self
    }

    /// Set the bounded-wait limit, in whole seconds.
    pub fn max_wait_secs(&mut self, secs: u64) -> &mut Self {
        self.max_wait_secs = secs;
        self
    }

    /// Set the private key file.
    pub fn pem_file(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.pem_file = Some(p.as_ref().to_path_buf());
        self
    }

    /// Set the directory control directories are created in.
    pub fn control_dir(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.control_dir = Some(p.as_ref().to_path_buf());
        self
    }

    /// Set the error policy of exec runs.
    pub fn exec_errors(&mut self, policy: ErrorPolicy) -> &mut Self {
        self.exec_errors = policy;
        self
    }

    /// Set the error policy of shell runs.
    pub fn shell_errors(&mut self, policy: ErrorPolicy) -> &mut Self {
        self.shell_errors = policy;
        self
    }

    pub(crate) fn keep_alive_interval_duration(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub(crate) fn session_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub(crate) fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// When a bounded-wait shell run starting at `now` gives up, or `None` when the bound
    /// does not fit the clock.
    pub(crate) fn max_wait_deadline(&self, now: Instant) -> Option<Instant> {
        now.checked_add(self.max_wait())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Errors from loading a [`RunnerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file")]
    Io(#[source] io::Error),
    /// The file is not valid configuration JSON.
    #[error("failed to parse config JSON")]
    Json(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.keep_alive_interval_duration(), Duration::from_secs(120));
        assert_eq!(config.keep_alive_max_missed, 1000);
        assert_eq!(config.pty_type.as_deref(), Some("dumb"));
        assert_eq!(config.max_wait(), Duration::from_secs(10));
        assert!(config.verbose);
        assert!(!config.ignore_timeout);
        assert_eq!(config.exec_errors, ErrorPolicy::BestEffort);
        assert_eq!(config.shell_errors, ErrorPolicy::Propagate);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RunnerConfig = serde_json::from_str(
            r#"{ "ignore_timeout": true, "max_wait_secs": 3, "exec_errors": "propagate" }"#,
        )
        .unwrap();
        assert!(config.ignore_timeout);
        assert_eq!(config.max_wait_secs, 3);
        assert_eq!(config.exec_errors, ErrorPolicy::Propagate);
        assert_eq!(config.pty_type.as_deref(), Some("dumb"));
        assert_eq!(config.session_timeout_ms, 100_000);
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "pem_file": "/keys/id_rsa", "pty_type": null }}"#).unwrap();

        let config = RunnerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pem_file, Some(PathBuf::from("/keys/id_rsa")));
        assert_eq!(config.pty_type, None);

        let missing = RunnerConfig::from_file("/definitely/not/here.json");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SSH_RUNNER_MAX_WAIT_SECS", "42"),
            ("SSH_RUNNER_IGNORE_TIMEOUT", "yes"),
            ("SSH_RUNNER_VERBOSE", "maybe"),
            ("SSH_RUNNER_PTY_TYPE", "vt100"),
        ]
        .into_iter()
        .collect();

        let mut config = RunnerConfig::default();
        config.apply_vars(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_wait_secs, 42);
        assert!(config.ignore_timeout);
        // unparseable values leave the setting alone
        assert!(config.verbose);
        assert_eq!(config.pty_type.as_deref(), Some("vt100"));
        assert_eq!(config.pem_file, None);
    }

    #[test]
    fn setters_chain() {
        let mut config = RunnerConfig::default();
        config
            .keep_alive_interval(Duration::from_secs(30))
            .pty_type(None)
            .max_wait_secs(1)
            .exec_errors(ErrorPolicy::Propagate);
        assert_eq!(config.keep_alive_interval_ms, 30_000);
        assert_eq!(config.pty_type, None);
        assert_eq!(config.max_wait_secs, 1);
        assert_eq!(config.exec_errors, ErrorPolicy::Propagate);
    }

    #[test]
    fn huge_durations_saturate() {
        let mut config = RunnerConfig::default();
        config
            .keep_alive_interval(Duration::MAX)
            .session_timeout(Duration::MAX);
        assert_eq!(config.keep_alive_interval_ms, u64::MAX);
        assert_eq!(config.session_timeout_ms, u64::MAX);
    }

    #[test]
    fn max_wait_deadline() {
        let now = Instant::now();
        let mut config = RunnerConfig::default();
        assert_eq!(
            config.max_wait_deadline(now),
            Some(now + Duration::from_secs(10))
        );

        config.max_wait_secs(u64::MAX);
        assert_eq!(config.max_wait_deadline(now), None);

        let config: RunnerConfig =
            serde_json::from_str(&format!(r#"{{ "max_wait_secs": {} }}"#, u64::MAX)).unwrap();
        assert_eq!(config.max_wait_deadline(now), None);
    }

    #[test]
    fn config_error_sources() {
        use std::error::Error as _;

        let err = RunnerConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert_eq!(err.to_string(), "failed to read config file");
        assert!(err.source().unwrap().downcast_ref::<io::Error>().is_some());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = RunnerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
        assert!(err.source().is_some());
    }
}
