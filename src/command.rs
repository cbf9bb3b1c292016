use super::RemoteChild;
use super::{Error, Session};

use std::ffi::OsStr;
use std::process::{self, Stdio};

use tokio::process as tokio_process;

/// A remote process builder, providing fine-grained control over how a new remote process should
/// be spawned.
///
/// A default configuration can be generated using [`Session::command(program)`](Session::command),
/// where `program` gives a path to the program to be executed. Additional builder methods allow
/// the configuration to be changed (for example, by adding arguments) prior to spawning.
/// The interface is almost identical to that of [`std::process::Command`].
///
/// # Exit status
///
/// The `ssh` command generally forwards the exit status of the remote process. The exception is if
/// a protocol-level error occured, in which case it will return with exit status 255. Since the
/// remote process _could_ also return with exit status 255, we have no reliable way to distinguish
/// between remote errors and errors from `ssh`, but this library _assumes_ that 255 means the
/// error came from `ssh`, and acts accordingly.
#[derive(Debug)]
pub struct Command<'s> {
    session: &'s Session,
    builder: tokio_process::Command,
}

impl<'s> Command<'s> {
    pub(crate) fn new(session: &'s Session, mut builder: tokio_process::Command) -> Self {
        // Disconnects the channel at `RemoteChild::drop`, but does not kill the remote
        // process.
        builder
            .kill_on_drop(true)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        Self { session, builder }
    }

    /// Adds an argument to pass to the remote program.
    ///
    /// Before it is passed to the remote host, `arg` is escaped so that special characters
    /// aren't evaluated by the remote shell. If you do not want this behavior, use
    /// [`raw_arg`](Command::raw_arg).
    pub fn arg<S: AsRef<str>>(&mut self, arg: S) -> &mut Self {
        self.builder
            .arg(&*shell_escape::unix::escape(arg.as_ref().into()));
        self
    }

    /// Adds an argument to pass to the remote program.
    ///
    /// Unlike [`arg`](Command::arg), this method does not shell-escape `arg`.
    pub fn raw_arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.builder.arg(arg);
        self
    }

    /// Set an environment variable of the local `ssh` client.
    ///
    /// This does not reach the remote process, with the exception of `TERM` when a
    /// pseudo-terminal is requested.
    pub(crate) fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, val: V) -> &mut Self {
        self.builder.env(key, val);
        self
    }

    /// Configuration for the remote process's standard input (stdin) handle.
    pub fn stdin<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.builder.stdin(cfg);
        self
    }

    /// Configuration for the remote process's standard output (stdout) handle.
    pub fn stdout<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.builder.stdout(cfg);
        self
    }

    /// Configuration for the remote process's standard error (stderr) handle.
    pub fn stderr<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.builder.stderr(cfg);
        self
    }

    /// Executes the remote command without waiting for it, returning a handle to it instead.
    pub fn spawn(&mut self) -> Result<RemoteChild<'s>, Error> {
        let child = self.builder.spawn().map_err(Error::Ssh)?;
        Ok(RemoteChild::new(self.session, child))
    }

    /// Executes the remote command, waiting for it to finish and collecting all of its output.
    ///
    /// Stdout and stderr are captured, and stdin reads as empty.
    pub async fn output(&mut self) -> Result<process::Output, Error> {
        self.builder
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = self.builder.output().await.map_err(Error::Ssh)?;
        match Error::from_channel_exit(output.status.code(), &String::from_utf8_lossy(&output.stderr)) {
            Some(err) => Err(err),
            None => Ok(output),
        }
    }

    /// Executes the remote command, waiting for it to finish and collecting its exit status.
    pub async fn status(&mut self) -> Result<process::ExitStatus, Error> {
        let status = self.builder.status().await.map_err(Error::Ssh)?;
        match Error::from_channel_exit(status.code(), "") {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }
}
