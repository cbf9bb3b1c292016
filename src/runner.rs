use super::demux::{wrap_commands, CommandOutputs};
use super::outcome::exit_code_or_warn;
use super::{Channel, Error, ErrorPolicy, KnownHosts, Outcome, RunnerConfig, Session, SessionBuilder};

use tokio::time::Instant;

/// Runs exec and shell invocations against remote hosts, one session per invocation.
///
/// Every `run_*` method takes ownership of the [`Session`] it is given, and the session is
/// closed before the method returns, whether the invocation succeeded or not. Open a new
/// session with [`connect`](SshRunner::connect) for the next invocation.
///
/// The exit status of each invocation is returned in its [`Outcome`]. The runner also
/// remembers the status of the most recent invocation for [`last_exit_code`](SshRunner::last_exit_code).
#[derive(Debug, Default)]
pub struct SshRunner {
    config: RunnerConfig,
    last_exit_code: Option<i32>,
}

impl SshRunner {
    /// Create a runner with the given configuration.
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            last_exit_code: None,
        }
    }

    /// The runner's configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Mutable access to the runner's configuration, for the builder-style setters.
    pub fn config_mut(&mut self) -> &mut RunnerConfig {
        &mut self.config
    }

    /// A [`SessionBuilder`] preconfigured with this runner's keep-alive, timeout, identity and
    /// host-key settings.
    ///
    /// Host keys are always accepted (`StrictHostKeyChecking=no`) and GSSAPI authentication
    /// is disabled.
    pub fn session_builder(&self, username: &str, port: u16, password: Option<&str>) -> SessionBuilder {
        let mut builder = SessionBuilder::default();
        builder
            .user(username.to_owned())
            .port(port)
            .known_hosts_check(KnownHosts::Accept)
            .server_alive_interval(self.config.keep_alive_interval_duration())
            .server_alive_count_max(self.config.keep_alive_max_missed)
            .tcp_keep_alive(true)
            .connect_timeout(self.config.session_timeout_duration());

        if let Some(password) = password {
            builder.password(password);
        }
        if let Some(ref pem) = self.config.pem_file {
            builder.keyfile(pem);
        }
        if let Some(ref dir) = self.config.control_dir {
            builder.control_directory(dir);
        }
        builder
    }

    /// Connect to `host` as `username`.
    ///
    /// Any failure to negotiate or authenticate is reported as [`Error::Connect`].
    pub async fn connect(
        &self,
        username: &str,
        host: &str,
        port: u16,
        password: Option<&str>,
    ) -> Result<Session, Error> {
        self.session_builder(username, port, password)
            .connect(host)
            .await
    }

    /// Exit status of the last invocation.
    ///
    /// Returns [`EXIT_CODE_UNSET`](crate::EXIT_CODE_UNSET) and logs a warning when the last
    /// invocation did not set one (or there was none yet).
    pub fn last_exit_code(&self) -> i32 {
        exit_code_or_warn(self.last_exit_code)
    }

    /// Exit status of the last invocation, if it set one.
    pub fn exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    /// Run `command` on an exec channel and collect its output and exit status.
    ///
    /// Remote stderr is forwarded to our own stderr and stdin is empty. With the default
    /// [`ErrorPolicy::BestEffort`] this never fails: errors are logged and an empty
    /// [`Outcome`] is returned.
    pub async fn run_exec(&mut self, session: Session, command: &str) -> Result<Outcome, Error> {
        self.last_exit_code = None;
        let result = self.drive_exec(&session, command).await;
        let result = release(session, result).await;
        self.settle(self.config.exec_errors, "exec", result)
    }

    async fn drive_exec(&self, session: &Session, command: &str) -> Result<Outcome, Error> {
        session.check().await?;
        if self.config.verbose {
            tracing::info!(destination = session.destination(), command, "command");
        }

        let mut channel = session.open_exec(command)?;
        let result = self.collect_exec(&mut channel).await;
        disconnect(channel, result).await
    }

    async fn collect_exec(&self, channel: &mut Channel<'_>) -> Result<Outcome, Error> {
        let verbose = self.config.verbose;
        let output = channel
            .read_to_eof(|chunk| {
                if verbose {
                    tracing::info!("{}", String::from_utf8_lossy(chunk));
                }
            })
            .await?;

        let status = channel.exit_status().await?;
        tracing::info!(exit_status = ?status.code(), "exit-status");
        Ok(Outcome::new(output, status.code()))
    }

    /// Run `commands` one after another in a single interactive shell, followed by `exit`.
    ///
    /// How the transcript is collected depends on
    /// [`RunnerConfig::ignore_timeout`]:
    ///
    /// * off (the default): output is read until the shell closes or
    ///   [`RunnerConfig::max_wait_secs`] pass, whichever is first. Anything the shell prints
    ///   after that is lost, and no exit status is recorded.
    /// * on: output is read until the shell closes, and its exit status is recorded.
    ///
    /// With the default [`ErrorPolicy::Propagate`], errors are returned once the channel and
    /// session have been released.
    pub async fn run_shell<S: AsRef<str>>(
        &mut self,
        session: Session,
        commands: &[S],
    ) -> Result<Outcome, Error> {
        self.last_exit_code = None;
        let result = self.drive_shell(&session, commands).await;
        let result = release(session, result).await;
        self.settle(self.config.shell_errors, "shell", result)
    }

    async fn drive_shell<S: AsRef<str>>(
        &self,
        session: &Session,
        commands: &[S],
    ) -> Result<Outcome, Error> {
        session.check().await?;

        let mut channel = session.open_shell(self.config.pty_type.as_deref())?;
        let result = self.converse(&mut channel, commands).await;
        disconnect(channel, result).await
    }

    async fn converse<S: AsRef<str>>(
        &self,
        channel: &mut Channel<'_>,
        commands: &[S],
    ) -> Result<Outcome, Error> {
        for command in commands {
            channel.write_line(command.as_ref()).await?;
        }
        channel.write_line("exit").await?;
        channel.close_input().await?;

        let verbose = self.config.verbose;
        let outcome = if self.config.ignore_timeout {
            let output = channel
                .read_to_eof(|chunk| {
                    if verbose {
                        tracing::debug!("{}", String::from_utf8_lossy(chunk));
                    }
                })
                .await?;
            let status = channel.exit_status().await?;
            tracing::info!(exit_status = ?status.code(), "exit-status");
            Outcome::new(output, status.code())
        } else {
            let output = match self.config.max_wait_deadline(Instant::now()) {
                Some(deadline) => channel.read_until(deadline).await?,
                // a wait bound beyond what the clock can represent is no bound at all
                None => channel.read_to_eof(|_| {}).await?,
            };
            if !channel.is_eof() {
                tracing::warn!(
                    max_wait_secs = self.config.max_wait_secs,
                    "shell still running after the wait bound, transcript may be incomplete"
                );
            }
            Outcome::new(output, None)
        };

        if verbose {
            tracing::debug!(transcript = %outcome.output, "shell finished");
        }
        Ok(outcome)
    }

    /// Run `commands` in one shell and split the transcript back into per-command output.
    ///
    /// Each command is bracketed by marker lines (see [`wrap_commands`]) so that its output can
    /// be told apart from the others'. The remote shell must support `echo` and `$( ... )`.
    pub async fn run_shell_enhanced<S: AsRef<str>>(
        &mut self,
        session: Session,
        commands: &[S],
    ) -> Result<CommandOutputs, Error> {
        let wrapped = wrap_commands(commands);
        let outcome = self.run_shell(session, wrapped.as_slice()).await?;
        Ok(CommandOutputs::parse(commands, &outcome.output))
    }

    fn settle(
        &mut self,
        policy: ErrorPolicy,
        operation: &'static str,
        result: Result<Outcome, Error>,
    ) -> Result<Outcome, Error> {
        match result {
            Ok(outcome) => {
                self.last_exit_code = outcome.exit_code;
                Ok(outcome)
            }
            Err(e) => match policy {
                ErrorPolicy::Propagate => Err(e),
                ErrorPolicy::BestEffort => {
                    tracing::error!(operation, error = %e, "remote invocation failed");
                    Ok(Outcome::empty())
                }
            },
        }
    }
}

/// Disconnect `channel`, keeping the result of whatever ran on it.
async fn disconnect(channel: Channel<'_>, result: Result<Outcome, Error>) -> Result<Outcome, Error> {
    if let Err(e) = channel.disconnect().await {
        tracing::warn!(error = %e, "failed to disconnect channel");
    }
    result
}

/// Close `session`, keeping the result of whatever ran on it.
async fn release(session: Session, result: Result<Outcome, Error>) -> Result<Outcome, Error> {
    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "failed to close session");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn args(builder: &SessionBuilder) -> Vec<String> {
        builder
            .master_command(Path::new("/run/ctl"), None, "build.example.com")
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn exit_code_starts_unset() {
        let runner = SshRunner::default();
        assert_eq!(runner.exit_code(), None);
        assert_eq!(runner.last_exit_code(), crate::EXIT_CODE_UNSET);
    }

    #[test]
    fn session_builder_applies_config() {
        let mut config = RunnerConfig::default();
        config
            .pem_file("/keys/ci.pem")
            .keep_alive_interval(Duration::from_secs(60))
            .keep_alive_max_missed(5);
        let runner = SshRunner::new(config);

        let args = args(&runner.session_builder("ci", 2022, None));
        for expected in [
            "StrictHostKeyChecking=no",
            "GSSAPIAuthentication=no",
            "TCPKeepAlive=yes",
            "ServerAliveInterval=60",
            "ServerAliveCountMax=5",
            "ConnectTimeout=100",
            "IdentitiesOnly=yes",
            "/keys/ci.pem",
            "2022",
            "ci",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {}", expected);
        }
    }

    #[test]
    fn session_builder_defaults_to_two_minute_keep_alive() {
        let runner = SshRunner::default();
        let args = args(&runner.session_builder("ci", 22, Some("secret")));
        assert!(args.iter().any(|a| a == "ServerAliveInterval=120"));
        assert!(args.iter().any(|a| a == "ServerAliveCountMax=1000"));
        assert!(!args.iter().any(|a| a == "IdentitiesOnly=yes"));
    }

    #[test]
    fn sub_second_keep_alive_rounds_up() {
        let mut config = RunnerConfig::default();
        config.keep_alive_interval(Duration::from_millis(200));
        let runner = SshRunner::new(config);

        let args = args(&runner.session_builder("ci", 22, None));
        assert!(args.iter().any(|a| a == "ServerAliveInterval=1"));
    }

    #[test]
    fn best_effort_swallows_errors() {
        let mut runner = SshRunner::default();
        let outcome = runner
            .settle(ErrorPolicy::BestEffort, "exec", Err(Error::Disconnected))
            .unwrap();
        assert_eq!(outcome, Outcome::empty());
        assert_eq!(runner.exit_code(), None);
    }

    #[test]
    fn propagate_returns_errors() {
        let mut runner = SshRunner::default();
        let err = runner
            .settle(ErrorPolicy::Propagate, "shell", Err(Error::Disconnected))
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }

    #[test]
    fn last_call_wins() {
        let mut runner = SshRunner::default();
        runner
            .settle(ErrorPolicy::Propagate, "exec", Ok(Outcome::new(b"x".to_vec(), Some(2))))
            .unwrap();
        assert_eq!(runner.last_exit_code(), 2);

        runner
            .settle(ErrorPolicy::Propagate, "shell", Ok(Outcome::new(Vec::new(), None)))
            .unwrap();
        assert_eq!(runner.exit_code(), None);
        assert_eq!(runner.last_exit_code(), crate::EXIT_CODE_UNSET);
    }
}
