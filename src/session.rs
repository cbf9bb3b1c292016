use super::{Channel, ChannelKind, Command, Error};

use std::borrow::Cow;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::process;

use tempfile::TempDir;

/// A single SSH session to a remote host.
///
/// A `Session` only exists while it is connected: it is handed out by
/// [`SessionBuilder::connect`](crate::SessionBuilder::connect) once the master connection has
/// authenticated. Use [`open_exec`](Session::open_exec) or [`open_shell`](Session::open_shell)
/// to start a channel on it, or [`command`](Session::command) for finer control over the remote
/// process.
///
/// When the `Session` is dropped, the connection to the remote host is severed, and any errors
/// silently ignored. To disconnect and be alerted to errors, use [`close`](Session::close).
#[derive(Debug)]
pub struct Session {
    ctl: Option<TempDir>,
    ctl_dir: Box<Path>,
    ctl_path: Box<Path>,
    addr: Box<str>,
    master_log: Box<Path>,
}

impl Session {
    pub(crate) fn new(ctl: TempDir, addr: &str) -> Self {
        let ctl_dir = ctl.path().to_path_buf().into_boxed_path();
        let log = ctl.path().join("log").into_boxed_path();
        let ctl_path = ctl.path().join("master").into_boxed_path();

        Self {
            ctl: Some(ctl),
            ctl_dir,
            ctl_path,
            addr: addr.into(),
            master_log: log,
        }
    }

    /// The private directory holding this session's control socket and master log.
    ///
    /// It is removed when the session is closed.
    pub fn control_directory(&self) -> &Path {
        &self.ctl_dir
    }

    /// The destination this session is connected to, as given to `ssh`.
    pub fn destination(&self) -> &str {
        &self.addr
    }

    fn new_std_cmd(&self, args: &[impl AsRef<OsStr>]) -> std::process::Command {
        let mut cmd = std::process::Command::new("ssh");
        cmd.stdin(Stdio::null())
            .arg("-S")
            .arg(&*self.ctl_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .args(args)
            .arg(&*self.addr);
        cmd
    }

    fn new_cmd(&self, args: &[impl AsRef<OsStr>]) -> process::Command {
        self.new_std_cmd(args).into()
    }

    /// Check the status of the underlying SSH connection.
    ///
    /// Since this does not run a remote command, it has a better chance of extracting useful error
    /// messages than other commands.
    pub async fn check(&self) -> Result<(), Error> {
        if self.ctl.is_none() {
            return Err(Error::Disconnected);
        }

        let check = self
            .new_cmd(&["-O", "check"])
            .output()
            .await
            .map_err(Error::Ssh)?;

        if let Some(255) = check.status.code() {
            if let Some(master_error) = self.discover_master_error() {
                Err(master_error)
            } else {
                Err(Error::Disconnected)
            }
        } else {
            Ok(())
        }
    }

    /// Constructs a new [`Command`] for launching the program at path `program` on the remote
    /// host.
    ///
    /// Before it is passed to the remote host, `program` is escaped so that special characters
    /// aren't evaluated by the remote shell. If you do not want this behavior, use
    /// [`raw_command`](Session::raw_command).
    ///
    /// The returned `Command` is a builder, with the following default configuration:
    ///
    /// * No arguments to the program
    /// * Empty stdin and discard stdout/stderr for `spawn` or `status`, but create output pipes
    ///   for `output`
    pub fn command<'a, S: Into<Cow<'a, str>>>(&self, program: S) -> Command<'_> {
        self.raw_command(&*shell_escape::unix::escape(program.into()))
    }

    /// Constructs a new [`Command`] for launching the program at path `program` on the remote
    /// host.
    ///
    /// Unlike [`command`](Session::command), this method does not shell-escape `program`, so it
    /// may be evaluated in unforeseen ways by the remote shell. This is what an exec channel
    /// wants: the whole command line is handed to the remote user's shell as-is.
    pub fn raw_command<S: AsRef<OsStr>>(&self, program: S) -> Command<'_> {
        // NOTE: we pass -p 9 nine here (the "discard" port) to ensure that ssh does not
        // succeed in establishing a _new_ connection if the master connection has failed.
        let mut cmd = self.new_cmd(&["-T", "-p", "9"]);
        cmd.arg("--").arg(program);

        Command::new(self, cmd)
    }

    /// Constructs a new [`Command`] that runs the provided shell command on the remote host.
    ///
    /// The provided command is passed as a single, escaped argument to `sh -c`, and from that
    /// point forward the behavior is up to `sh`. This assumes that the remote login shell is
    /// POSIX compliant, since it is the one undoing our level of escaping.
    pub fn shell<S: AsRef<str>>(&self, command: S) -> Command<'_> {
        let mut cmd = self.raw_command("sh");
        cmd.raw_arg("-c")
            .arg(command.as_ref());
        cmd
    }

    /// Open an exec channel running `command` through the remote user's shell.
    ///
    /// The channel reads from an empty stdin, forwards remote stderr to our own stderr, and
    /// exposes remote stdout through [`Channel::read_to_eof`]. It ends once the remote command
    /// exits.
    pub fn open_exec(&self, command: &str) -> Result<Channel<'_>, Error> {
        let mut cmd = self.raw_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        tracing::debug!(destination = %self.addr, command, "opening exec channel");
        Ok(Channel::new(ChannelKind::Exec, cmd.spawn()?))
    }

    /// Open an interactive shell channel on the remote host.
    ///
    /// With `pty` set, a pseudo-terminal of that type is requested (`ssh -tt`, advertising
    /// `TERM=<pty>`), in which case remote stderr is folded into the terminal output. Without
    /// one, the remote login shell reads commands from a plain pipe and its stderr is forwarded
    /// to ours.
    pub fn open_shell(&self, pty: Option<&str>) -> Result<Channel<'_>, Error> {
        let tty = if pty.is_some() { "-tt" } else { "-T" };
        let mut cmd = Command::new(self, self.new_cmd(&[tty, "-p", "9"]));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(term) = pty {
            cmd.env("TERM", term);
        }

        tracing::debug!(destination = %self.addr, pty, "opening shell channel");
        Ok(Channel::new(ChannelKind::Shell, cmd.spawn()?))
    }

    /// Terminate the remote connection.
    ///
    /// This asks the master to exit and removes the control directory.
    pub async fn close(mut self) -> Result<(), Error> {
        let mut exit_cmd = self.new_cmd(&["-O", "exit"]);

        // Take self.ctl so that drop would do nothing
        let ctl = match self.ctl.take() {
            Some(ctl) => ctl,
            None => return Ok(()),
        };

        let exit = exit_cmd.output().await.map_err(Error::Ssh)?;

        if let Some(master_error) = self.discover_master_error() {
            return Err(master_error);
        }

        // the -O exit command failing while the master left no error behind means the remote
        // end already closed the connection cleanly. we were asked to close it, so that counts
        // as success.
        if !exit.status.success() {
            let exit_err = String::from_utf8_lossy(&exit.stderr);
            tracing::debug!(error = %exit_err.trim(), "ssh -O exit did not succeed");
        }

        ctl.close().map_err(Error::Cleanup)?;
        tracing::info!(destination = %self.addr, "ssh session closed");

        Ok(())
    }

    fn discover_master_error(&self) -> Option<Error> {
        let err = match fs::read_to_string(&self.master_log) {
            Ok(err) => err,
            // no log means the master never had anything to say
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => return Some(Error::Master(e)),
        };
        let mut stderr = err.trim();

        stderr = stderr.strip_prefix("ssh: ").unwrap_or(stderr);

        while stderr.starts_with("Warning: Permanently added ") {
            // added to hosts file -- let's ignore that message
            stderr = stderr.split_once('\n').map(|x| x.1.trim()).unwrap_or("");
        }

        if stderr.is_empty() {
            return None;
        }

        let kind = if stderr.contains("Connection to") && stderr.contains("closed by remote host") {
            io::ErrorKind::ConnectionAborted
        } else {
            io::ErrorKind::Other
        };

        Some(Error::Master(io::Error::new(kind, stderr)))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Keep tempdir alive until the master has been told to exit
        let _ctl = match self.ctl.take() {
            Some(ctl) => ctl,
            // return since close must have already been called.
            None => return,
        };

        let _res = self
            .new_std_cmd(&["-O", "exit"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}
