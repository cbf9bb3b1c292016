//! Exec and shell channels multiplexed over a [`Session`](crate::Session).

use super::{Error, RemoteChild};

use std::io;
use std::process::ExitStatus;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::time::{self, Instant};

/// Size of the buffer channel output is read into.
pub const CHUNK_SIZE: usize = 1024;

/// The two flavours of channel a session hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// A single command that ends when its remote process exits.
    Exec,
    /// An interactive login shell that ends when told to `exit` or when the remote side
    /// closes it.
    Shell,
}

/// One logical sub-stream over a session, owning its input and output streams.
///
/// Obtained from [`Session::open_exec`](crate::Session::open_exec) or
/// [`Session::open_shell`](crate::Session::open_shell).
#[derive(Debug)]
pub struct Channel<'s> {
    kind: ChannelKind,
    child: RemoteChild<'s>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    eof: bool,
}

impl<'s> Channel<'s> {
    pub(crate) fn new(kind: ChannelKind, mut child: RemoteChild<'s>) -> Self {
        let stdin = child.stdin().take();
        let stdout = child.stdout().take();
        Self {
            kind,
            child,
            stdin,
            stdout,
            eof: false,
        }
    }

    /// Which flavour of channel this is.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Whether the channel's output stream has reached end-of-stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Write `line` followed by a line feed to the channel's input.
    pub async fn write_line(&mut self, line: &str) -> Result<(), Error> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            Error::ChildIo(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel input already closed",
            ))
        })?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(Error::ChildIo)?;
        stdin.write_all(b"\n").await.map_err(Error::ChildIo)
    }

    /// Flush and close the channel's input, signalling the end of the command batch.
    pub async fn close_input(&mut self) -> Result<(), Error> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().await.map_err(Error::ChildIo)?;
            stdin.shutdown().await.map_err(Error::ChildIo)?;
        }
        Ok(())
    }

    /// Read output until end-of-stream, handing every chunk to `on_chunk` as it arrives.
    pub async fn read_to_eof<F>(&mut self, on_chunk: F) -> Result<Vec<u8>, Error>
    where
        F: FnMut(&[u8]),
    {
        let out = match self.stdout.as_mut() {
            Some(stdout) => read_to_eof(stdout, on_chunk)
                .await
                .map_err(Error::ChildIo)?,
            None => Vec::new(),
        };
        self.eof = true;
        Ok(out)
    }

    /// Read output until end-of-stream or until `deadline` passes, whichever comes first.
    pub async fn read_until(&mut self, deadline: Instant) -> Result<Vec<u8>, Error> {
        let (out, eof) = match self.stdout.as_mut() {
            Some(stdout) => read_until(stdout, deadline)
                .await
                .map_err(Error::ChildIo)?,
            None => (Vec::new(), true),
        };
        self.eof = eof;
        Ok(out)
    }

    /// Wait for the channel to close and return its exit status.
    pub async fn exit_status(&mut self) -> Result<ExitStatus, Error> {
        self.child.wait().await
    }

    /// Disconnect the channel.
    pub async fn disconnect(self) -> Result<(), Error> {
        let Channel { child, stdin, .. } = self;
        drop(stdin);
        child.disconnect().await.map_err(Error::ChildIo)
    }
}

/// Drain `reader` until end-of-stream in chunks of [`CHUNK_SIZE`].
pub(crate) async fn read_to_eof<R, F>(reader: &mut R, mut on_chunk: F) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut out = Vec::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        on_chunk(&buf[..n]);
        out.extend_from_slice(&buf[..n]);
    }
}

/// Drain `reader` until end-of-stream or `deadline`.
///
/// Whatever arrived before the deadline is kept. The flag reports whether end-of-stream was
/// reached.
pub(crate) async fn read_until<R>(reader: &mut R, deadline: Instant) -> io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        // `read` is cancel safe, so nothing is lost when the deadline wins the race
        match time::timeout_at(deadline, reader.read(&mut buf)).await {
            Err(_elapsed) => return Ok((out, false)),
            Ok(Ok(0)) => return Ok((out, true)),
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e),
        }
    }
}
