use super::{Error, Session};

use std::io;
use std::process::ExitStatus;

use tokio::process;

/// Representation of a running or exited remote child process.
///
/// A remote child is really just a handle to the _local_ `ssh` client that carries one channel
/// over the session's master connection. Dropping it (or calling
/// [`disconnect`](RemoteChild::disconnect)) terminates that client, which closes the channel but
/// does not necessarily kill the remote process.
#[derive(Debug)]
pub struct RemoteChild<'s> {
    // the channel is only usable while its master is
    _session: &'s Session,
    channel: Option<process::Child>,
}

impl<'s> RemoteChild<'s> {
    pub(crate) fn new(session: &'s Session, child: process::Child) -> Self {
        Self {
            _session: session,
            channel: Some(child),
        }
    }

    fn channel(&mut self) -> io::Result<&mut process::Child> {
        self.channel
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel disconnected"))
    }

    /// Waits for the remote child to exit completely, returning the status that it exited with.
    ///
    /// Unlike [`Command::output`](crate::Command::output), a status of 127 is passed through
    /// as-is, since for a shell channel it only describes the last command the shell ran.
    pub async fn wait(&mut self) -> Result<ExitStatus, Error> {
        let status = self
            .channel()
            .map_err(Error::ChildIo)?
            .wait()
            .await
            .map_err(Error::Remote)?;
        Self::interpret(status)
    }

    fn interpret(status: ExitStatus) -> Result<ExitStatus, Error> {
        match status.code() {
            Some(255) => Err(Error::Disconnected),
            None => Err(Error::RemoteProcessTerminated),
            Some(_) => Ok(status),
        }
    }

    /// Access the handle for writing to the remote child's standard input (stdin), if requested.
    pub fn stdin(&mut self) -> &mut Option<process::ChildStdin> {
        match self.channel.as_mut() {
            Some(channel) => &mut channel.stdin,
            None => unreachable!("stdin of a disconnected channel"),
        }
    }

    /// Access the handle for reading from the remote child's standard output (stdout), if
    /// requested.
    pub fn stdout(&mut self) -> &mut Option<process::ChildStdout> {
        match self.channel.as_mut() {
            Some(channel) => &mut channel.stdout,
            None => unreachable!("stdout of a disconnected channel"),
        }
    }

    /// Close the local end of the channel.
    ///
    /// A local `ssh` client that has not exited yet is killed, which disconnects it from the
    /// master, but does not kill the remote process.
    pub async fn disconnect(mut self) -> io::Result<()> {
        if let Some(mut channel) = self.channel.take() {
            if channel.try_wait()?.is_none() {
                channel.kill().await?;
            }
        }
        Ok(())
    }
}

impl Drop for RemoteChild<'_> {
    fn drop(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            // this disconnects, but does not kill the remote process
            let _ = channel.start_kill();
        }
    }
}
