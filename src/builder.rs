use super::{Error, Session};

use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::{Builder, TempDir};
use tokio::process;

/// Name of the environment variable through which the master reads its password.
///
/// It is only ever set on the master `ssh` process, never in our own environment.
const ASKPASS_SECRET_VAR: &str = "SSH_RUNNER_ASKPASS_SECRET";

const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$SSH_RUNNER_ASKPASS_SECRET\"\n";

#[derive(Clone)]
struct Password(String);

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Build a [`Session`] with options.
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    user: Option<String>,
    port: Option<String>,
    password: Option<Password>,
    keyfile: Option<PathBuf>,
    connect_timeout: Option<String>,
    server_alive_interval: Option<u64>,
    server_alive_count_max: Option<u32>,
    tcp_keep_alive: bool,
    known_hosts_check: KnownHosts,
    control_dir: Option<PathBuf>,
    config_file: Option<PathBuf>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            user: None,
            port: None,
            password: None,
            keyfile: None,
            connect_timeout: None,
            server_alive_interval: None,
            server_alive_count_max: None,
            tcp_keep_alive: true,
            known_hosts_check: KnownHosts::Add,
            control_dir: None,
            config_file: None,
        }
    }
}

impl SessionBuilder {
    /// Set the ssh user (`ssh -l`).
    ///
    /// Defaults to `None`.
    pub fn user(&mut self, user: String) -> &mut Self {
        self.user = Some(user);
        self
    }

    /// Set the port to connect on (`ssh -p`).
    ///
    /// Defaults to `None`.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = Some(format!("{}", port));
        self
    }

    /// Authenticate with a password.
    ///
    /// The password is handed to the master `ssh` process through a private askpass helper
    /// living in the session's control directory, and only a single prompt is answered. It
    /// is never written to disk.
    ///
    /// Defaults to `None`, in which case `ssh` runs in batch mode and only non-interactive
    /// authentication works.
    pub fn password(&mut self, password: impl Into<String>) -> &mut Self {
        self.password = Some(Password(password.into()));
        self
    }

    /// Set the keyfile to use (`ssh -i`).
    ///
    /// Defaults to `None`.
    pub fn keyfile(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.keyfile = Some(p.as_ref().to_path_buf());
        self
    }

    /// See [`KnownHosts`].
    ///
    /// Default `KnownHosts::Add`.
    pub fn known_hosts_check(&mut self, k: KnownHosts) -> &mut Self {
        self.known_hosts_check = k;
        self
    }

    /// Set the connection timeout (`ssh -o ConnectTimeout`).
    ///
    /// This value is specified in seconds. Any sub-second duration remainder will be ignored.
    /// Defaults to `None`.
    pub fn connect_timeout(&mut self, d: Duration) -> &mut Self {
        self.connect_timeout = Some(d.as_secs().to_string());
        self
    }

    /// Set the timeout interval after which if no data has been received from the server, ssh
    /// will request a response from the server (`ssh -o ServerAliveInterval`).
    ///
    /// This value is specified in seconds. Any sub-second duration remainder will be ignored,
    /// but the interval is at least one second, since zero turns the probes off.
    /// Defaults to `None`.
    pub fn server_alive_interval(&mut self, d: Duration) -> &mut Self {
        self.server_alive_interval = Some(d.as_secs().max(1));
        self
    }

    /// Set how many keep-alive probes may go unanswered before the connection is dropped
    /// (`ssh -o ServerAliveCountMax`).
    ///
    /// Defaults to `None`.
    pub fn server_alive_count_max(&mut self, count: u32) -> &mut Self {
        self.server_alive_count_max = Some(count);
        self
    }

    /// Enable or disable TCP keep-alive messages (`ssh -o TCPKeepAlive`).
    ///
    /// Defaults to `true`.
    pub fn tcp_keep_alive(&mut self, enabled: bool) -> &mut Self {
        self.tcp_keep_alive = enabled;
        self
    }

    /// Set the directory in which the temporary directory containing the control socket will
    /// be created.
    ///
    /// If not set, the user's runtime directory is used, or the system temporary directory
    /// where there is none.
    pub fn control_directory(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.control_dir = Some(p.as_ref().to_path_buf());
        self
    }

    /// Set an alternative per-user configuration file.
    ///
    /// By default, ssh uses `~/.ssh/config`. This is equivalent to `ssh -F <p>`.
    ///
    /// Defaults to `None`.
    pub fn config_file(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.config_file = Some(p.as_ref().to_path_buf());
        self
    }

    /// Connect to the host at the given `host` over SSH.
    ///
    /// The format of `destination` is the same as the `destination` argument to `ssh`. It may be
    /// specified as either `[user@]hostname` or a URI of the form `ssh://[user@]hostname[:port]`.
    /// A username or port that is specified in the connection string overrides the one set in the
    /// builder (but does not change the builder).
    pub async fn connect<S: AsRef<str>>(&self, destination: S) -> Result<Session, Error> {
        let destination = destination.as_ref();
        let (builder, destination) = self.resolve(destination);
        builder.just_connect(destination).await
    }

    fn resolve<'a, 'b>(&'a self, mut destination: &'b str) -> (Cow<'a, Self>, &'b str) {
        // the "new" ssh://user@host:port form is not supported by all versions of ssh, so we
        // always translate it into the option form.
        let mut user = None;
        let mut port = None;
        if let Some(rest) = destination.strip_prefix("ssh://") {
            destination = rest;
            if let Some(at) = destination.find('@') {
                user = Some(&destination[..at]);
                destination = &destination[(at + 1)..];
            }
            if let Some(colon) = destination.rfind(':') {
                let p = &destination[(colon + 1)..];
                if let Ok(p) = p.parse() {
                    port = Some(p);
                    destination = &destination[..colon];
                }
            }
        }

        if user.is_none() && port.is_none() {
            return (Cow::Borrowed(self), destination);
        }

        let mut with_overrides = self.clone();
        if let Some(user) = user {
            with_overrides.user(user.to_owned());
        }

        if let Some(port) = port {
            with_overrides.port(port);
        }

        (Cow::Owned(with_overrides), destination)
    }

    fn build_tempdir(&self) -> Result<TempDir, Error> {
        let socketdir = match self.control_dir {
            Some(ref dir) => dir.clone(),
            None => dirs::runtime_dir().unwrap_or_else(std::env::temp_dir),
        };

        Builder::new()
            .prefix(".ssh-connection")
            .tempdir_in(socketdir)
            .map_err(Error::Connect)
    }

    /// Assemble the `ssh` invocation that starts the master for `destination` with its
    /// control socket and log inside `dir`.
    pub(crate) fn master_command(
        &self,
        dir: &Path,
        askpass: Option<&Path>,
        destination: &str,
    ) -> process::Command {
        let mut init = process::Command::new("ssh");

        init.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("-E")
            .arg(dir.join("log"))
            .arg("-S")
            .arg(dir.join("master"))
            .arg("-M")
            .arg("-f")
            .arg("-N")
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg("-o")
            .arg(self.known_hosts_check.as_option())
            .arg("-o")
            .arg("GSSAPIAuthentication=no")
            .arg("-o")
            .arg(if self.tcp_keep_alive {
                "TCPKeepAlive=yes"
            } else {
                "TCPKeepAlive=no"
            });

        match (&self.password, askpass) {
            (Some(password), Some(askpass)) => {
                init.arg("-o")
                    .arg("BatchMode=no")
                    .arg("-o")
                    .arg("NumberOfPasswordPrompts=1")
                    .env("SSH_ASKPASS", askpass)
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env(ASKPASS_SECRET_VAR, &password.0);

                // ssh before 8.4 ignores SSH_ASKPASS_REQUIRE and wants a display instead
                if std::env::var_os("DISPLAY").is_none() {
                    init.env("DISPLAY", ":0");
                }
            }
            _ => {
                init.arg("-o").arg("BatchMode=yes");
            }
        }

        if let Some(ref timeout) = self.connect_timeout {
            init.arg("-o").arg(format!("ConnectTimeout={}", timeout));
        }

        if let Some(ref interval) = self.server_alive_interval {
            init.arg("-o")
                .arg(format!("ServerAliveInterval={}", interval));
        }

        if let Some(ref count) = self.server_alive_count_max {
            init.arg("-o").arg(format!("ServerAliveCountMax={}", count));
        }

        if let Some(ref port) = self.port {
            init.arg("-p").arg(port);
        }

        if let Some(ref user) = self.user {
            init.arg("-l").arg(user);
        }

        if let Some(ref k) = self.keyfile {
            // if the user gives a keyfile, _only_ use that keyfile
            init.arg("-o").arg("IdentitiesOnly=yes");
            init.arg("-i").arg(k);
        }

        if let Some(ref config_file) = self.config_file {
            init.arg("-F").arg(config_file);
        }

        init.arg(destination);
        init
    }

    pub(crate) async fn just_connect<S: AsRef<str>>(&self, host: S) -> Result<Session, Error> {
        let destination = host.as_ref();

        let dir = self.build_tempdir()?;
        let askpass = match self.password {
            Some(_) => Some(write_askpass(dir.path()).map_err(Error::Connect)?),
            None => None,
        };

        let mut init = self.master_command(dir.path(), askpass.as_deref(), destination);

        tracing::debug!(
            destination,
            user = self.user.as_deref(),
            port = self.port.as_deref(),
            "starting ssh master"
        );

        // ssh forks into the background once authenticated (-f), so the process we spawn
        // exits early and its status tells us whether the connection came up.
        let status = init
            .spawn()
            .map_err(Error::Connect)?
            .wait()
            .await
            .map_err(Error::Connect)?;

        if !status.success() {
            let log = fs::read_to_string(dir.path().join("log")).unwrap_or_default();
            let err = Error::interpret_ssh_error(&log);
            tracing::debug!(destination, error = %log.trim(), "ssh master failed to start");
            return Err(err);
        }

        tracing::info!(destination, "ssh session established");
        Ok(Session::new(dir, destination))
    }
}

fn write_askpass(dir: &Path) -> io::Result<PathBuf> {
    let path = dir.join("askpass");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o700)
        .open(&path)?;
    file.write_all(ASKPASS_SCRIPT.as_bytes())?;
    file.sync_all()?;
    Ok(path)
}

/// Specifies how the host's key fingerprint should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHosts {
    /// The host's fingerprint must match what is in the known hosts file.
    ///
    /// If the host is not in the known hosts file, the connection is rejected.
    ///
    /// This corresponds to `ssh -o StrictHostKeyChecking=yes`.
    Strict,
    /// Strict, but if the host is not already in the known hosts file, it will be added.
    ///
    /// This corresponds to `ssh -o StrictHostKeyChecking=accept-new`.
    Add,
    /// Accept whatever key the server provides and add it to the known hosts file.
    ///
    /// This corresponds to `ssh -o StrictHostKeyChecking=no`.
    Accept,
}

impl KnownHosts {
    fn as_option(&self) -> &'static str {
        match *self {
            KnownHosts::Strict => "StrictHostKeyChecking=yes",
            KnownHosts::Add => "StrictHostKeyChecking=accept-new",
            KnownHosts::Accept => "StrictHostKeyChecking=no",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &process::Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn env(cmd: &process::Command, key: &str) -> Option<String> {
        cmd.as_std()
            .get_envs()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v)
            .map(|v| v.to_string_lossy().into_owned())
    }

    #[test]
    fn resolve() {
        let b = SessionBuilder::default();
        let (b, d) = b.resolve("ssh://test-user@127.0.0.1:2222");
        assert_eq!(b.port.as_deref(), Some("2222"));
        assert_eq!(b.user.as_deref(), Some("test-user"));
        assert_eq!(d, "127.0.0.1");

        let b = SessionBuilder::default();
        let (b, d) = b.resolve("ssh://runnertest:2222");
        assert_eq!(b.port.as_deref(), Some("2222"));
        assert_eq!(b.user.as_deref(), None);
        assert_eq!(d, "runnertest");

        let b = SessionBuilder::default();
        let (b, d) = b.resolve("ssh://test-user@runnertest");
        assert_eq!(b.port.as_deref(), None);
        assert_eq!(b.user.as_deref(), Some("test-user"));
        assert_eq!(d, "runnertest");

        let b = SessionBuilder::default();
        let (b, d) = b.resolve("runnertest");
        assert_eq!(b.port.as_deref(), None);
        assert_eq!(b.user.as_deref(), None);
        assert_eq!(d, "runnertest");
    }

    #[test]
    fn master_command_keep_alive_and_host_keys() {
        let mut b = SessionBuilder::default();
        b.user("deploy".to_owned())
            .port(2222)
            .known_hosts_check(KnownHosts::Accept)
            .server_alive_interval(Duration::from_millis(120_500))
            .server_alive_count_max(1000)
            .connect_timeout(Duration::from_millis(100_000));

        let cmd = b.master_command(Path::new("/tmp/ctl"), None, "example.com");
        let args = args(&cmd);

        for expected in [
            "StrictHostKeyChecking=no",
            "GSSAPIAuthentication=no",
            "TCPKeepAlive=yes",
            "BatchMode=yes",
            "ServerAliveInterval=120",
            "ServerAliveCountMax=1000",
            "ConnectTimeout=100",
            "ControlPersist=yes",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {}", expected);
        }
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-l" && w[1] == "deploy"));
        assert!(args.windows(2).any(|w| w[0] == "-S" && w[1] == "/tmp/ctl/master"));
        assert_eq!(args.last().map(String::as_str), Some("example.com"));
        assert!(env(&cmd, "SSH_ASKPASS").is_none());
    }

    #[test]
    fn sub_second_keep_alive_stays_on() {
        let mut b = SessionBuilder::default();
        b.server_alive_interval(Duration::from_millis(500));

        let args = args(&b.master_command(Path::new("/tmp/ctl"), None, "host"));
        assert!(args.iter().any(|a| a == "ServerAliveInterval=1"));
        assert!(!args.iter().any(|a| a == "ServerAliveInterval=0"));
    }

    #[test]
    fn master_command_keyfile() {
        let mut b = SessionBuilder::default();
        b.keyfile("/home/me/.ssh/id_test");

        let args = args(&b.master_command(Path::new("/tmp/ctl"), None, "host"));
        assert!(args.iter().any(|a| a == "IdentitiesOnly=yes"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-i" && w[1] == "/home/me/.ssh/id_test"));
    }

    #[test]
    fn master_command_password() {
        let mut b = SessionBuilder::default();
        b.password("hunter2");

        let cmd = b.master_command(
            Path::new("/tmp/ctl"),
            Some(Path::new("/tmp/ctl/askpass")),
            "host",
        );
        let args = args(&cmd);
        assert!(args.iter().any(|a| a == "BatchMode=no"));
        assert!(args.iter().any(|a| a == "NumberOfPasswordPrompts=1"));
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        assert_eq!(env(&cmd, "SSH_ASKPASS").as_deref(), Some("/tmp/ctl/askpass"));
        assert_eq!(env(&cmd, "SSH_ASKPASS_REQUIRE").as_deref(), Some("force"));
        assert_eq!(env(&cmd, ASKPASS_SECRET_VAR).as_deref(), Some("hunter2"));
    }

    #[test]
    fn password_is_redacted() {
        let mut b = SessionBuilder::default();
        b.password("hunter2");
        assert!(!format!("{:?}", b).contains("hunter2"));
    }

    #[test]
    fn askpass_helper_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = write_askpass(dir.path()).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        let script = fs::read_to_string(&path).unwrap();
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains(ASKPASS_SECRET_VAR));
    }
}
