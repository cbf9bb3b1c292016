use std::io;

use thiserror::Error;

/// Errors that occur when connecting to a remote host or driving one of its channels.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The master connection failed.
    #[error("the master connection failed")]
    Master(#[source] io::Error),

    /// Failed to establish initial connection to the remote host.
    ///
    /// This covers both transport negotiation and authentication failures. The
    /// [`io::ErrorKind`] of the source tells them apart where `ssh` gave enough to go on
    /// (`PermissionDenied` for rejected credentials).
    #[error("failed to connect to the remote host")]
    Connect(#[source] io::Error),

    /// Failed to run the `ssh` command locally.
    #[error("the local ssh command could not be executed")]
    Ssh(#[source] io::Error),

    /// The remote process failed.
    #[error("the remote command could not be executed")]
    Remote(#[source] io::Error),

    /// The connection to the remote host was severed.
    ///
    /// This is a best-effort error, and it _may_ instead signify that the remote process
    /// exited with an error code of 255.
    ///
    /// You should call [`Session::check`](crate::Session::check) to verify if you get
    /// this error back.
    #[error("the connection was terminated")]
    Disconnected,

    /// Remote process is terminated.
    ///
    /// It is likely to be that the process is terminated by signal, so no exit status
    /// was reported for it.
    #[error("the remote process has terminated")]
    RemoteProcessTerminated,

    /// Failed to remove temporary dir where ssh socket and output is stored.
    #[error("failed to remove temporary ssh session directory")]
    Cleanup(#[source] io::Error),

    /// IO Error when writing to or reading from a channel.
    #[error("failure while accessing standard I/O of remote channel")]
    ChildIo(#[source] io::Error),
}

impl Error {
    pub(crate) fn interpret_ssh_error(stderr: &str) -> Self {
        // we want to turn the string-only ssh error into something a little more "handleable".
        // this is error-prone, but the best we can do.
        //
        // format is:
        //
        //     ssh: ssh error: io error
        let mut stderr = stderr.trim();
        stderr = stderr.strip_prefix("ssh: ").unwrap_or(stderr);
        while stderr.starts_with("Warning: Permanently added ") {
            // added to hosts file -- let's ignore that message
            stderr = stderr.split_once('\n').map(|x| x.1.trim()).unwrap_or("");
        }
        let mut kind = io::ErrorKind::ConnectionAborted;
        let mut err = stderr.splitn(2, ": ");
        if let Some(ssh_error) = err.next() {
            if ssh_error.starts_with("Could not resolve") {
                kind = io::ErrorKind::Other;
            }

            if let Some(io_error) = err.next() {
                match io_error {
                    "Network is unreachable" => {
                        kind = io::ErrorKind::Other;
                    }
                    "Connection refused" => {
                        kind = io::ErrorKind::ConnectionRefused;
                    }
                    e if ssh_error.starts_with("connect to host")
                        && (e == "Connection timed out" || e == "Operation timed out") =>
                    {
                        kind = io::ErrorKind::TimedOut;
                    }
                    e if ssh_error.starts_with("connect to host") && e == "Permission denied" => {
                        // macOS flavour of "network is unreachable"
                        kind = io::ErrorKind::Other;
                    }
                    e if e.contains("Permission denied (") => {
                        kind = io::ErrorKind::PermissionDenied;
                    }
                    _ => {}
                }
            }
        }

        Error::Connect(io::Error::new(kind, stderr))
    }

    /// Map the exit code of a finished channel process onto the error it stands for, if any.
    ///
    /// `ssh` reserves 255 for its own failures and the remote shell uses 127 for a missing
    /// program.
    pub(crate) fn from_channel_exit(code: Option<i32>, stderr: &str) -> Option<Self> {
        match code {
            Some(255) => Some(Error::Disconnected),
            Some(127) => Some(Error::Remote(io::Error::new(
                io::ErrorKind::NotFound,
                if stderr.trim().is_empty() {
                    "remote command not found"
                } else {
                    stderr.trim()
                },
            ))),
            None => Some(Error::RemoteProcessTerminated),
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{io, Error};

    #[test]
    fn parse_error() {
        let err = "ssh: Warning: Permanently added \'login.csail.mit.edu,128.52.131.0\' (ECDSA) to the list of known hosts.\r\nrunner@login.csail.mit.edu: Permission denied (publickey,gssapi-keyex,gssapi-with-mic,password,keyboard-interactive).";
        let err = Error::interpret_ssh_error(err);
        let target = io::Error::new(io::ErrorKind::PermissionDenied, "runner@login.csail.mit.edu: Permission denied (publickey,gssapi-keyex,gssapi-with-mic,password,keyboard-interactive).");
        if let Error::Connect(e) = err {
            assert_eq!(e.kind(), target.kind());
            assert_eq!(format!("{}", e), format!("{}", target));
        } else {
            unreachable!("{:?}", err);
        }
    }

    #[test]
    fn parse_refused_and_timeout() {
        let err = Error::interpret_ssh_error(
            "ssh: connect to host 10.0.0.1 port 2222: Connection refused\n",
        );
        assert!(matches!(err, Error::Connect(ref e) if e.kind() == io::ErrorKind::ConnectionRefused));

        let err = Error::interpret_ssh_error(
            "ssh: connect to host 10.0.0.1 port 22: Connection timed out",
        );
        assert!(matches!(err, Error::Connect(ref e) if e.kind() == io::ErrorKind::TimedOut));

        let err = Error::interpret_ssh_error("ssh: Could not resolve hostname nope: Name or service not known");
        assert!(matches!(err, Error::Connect(ref e) if e.kind() == io::ErrorKind::Other));
    }

    #[test]
    fn channel_exit_codes() {
        assert!(Error::from_channel_exit(Some(0), "").is_none());
        assert!(Error::from_channel_exit(Some(3), "").is_none());
        assert!(matches!(
            Error::from_channel_exit(Some(255), ""),
            Some(Error::Disconnected)
        ));
        assert!(matches!(
            Error::from_channel_exit(None, ""),
            Some(Error::RemoteProcessTerminated)
        ));
        match Error::from_channel_exit(Some(127), "sh: 1: nope: not found\n") {
            Some(Error::Remote(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::NotFound);
                assert_eq!(e.to_string(), "sh: 1: nope: not found");
            }
            other => unreachable!("{:?}", other),
        }
    }

    #[test]
    fn error_sanity() {
        use std::error::Error as _;

        let ioe = || io::Error::new(io::ErrorKind::Other, "test");
        let expect = ioe();

        for e in [
            Error::Master(ioe()),
            Error::Connect(ioe()),
            Error::Ssh(ioe()),
            Error::Remote(ioe()),
            Error::ChildIo(ioe()),
            Error::Cleanup(ioe()),
        ] {
            assert!(!format!("{}", e).is_empty());
            let e = e
                .source()
                .expect("source failed")
                .downcast_ref::<io::Error>()
                .expect("source not io");
            assert_eq!(e.kind(), expect.kind());
            assert_eq!(format!("{}", e), format!("{}", expect));
        }

        let e = Error::Disconnected;
        assert!(!format!("{}", e).is_empty());
        assert!(e.source().is_none());
    }
}
