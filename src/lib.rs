//! Run commands on remote hosts through OpenSSH, either one at a time on exec channels or in
//! batches through an interactive shell.
//!
//! This crate wraps the OpenSSH remote login client (`ssh` on most machines). A [`Session`] is
//! a background `ssh` master connection (see ssh's [`ControlMaster`] feature), authenticated
//! once when the session is [established](SessionBuilder::connect). Every [`Channel`] opened on
//! it is a short-lived `ssh` client multiplexed over that master, so channels are cheap and
//! never re-authenticate.
//!
//! Most callers go through a [`SshRunner`], which owns the tuning ([`RunnerConfig`]) and offers
//! three operations:
//!
//! * [`run_exec`](SshRunner::run_exec) runs one command on an exec channel and returns its
//!   output and exit status. By default it never fails: errors are logged and an empty
//!   [`Outcome`] comes back.
//! * [`run_shell`](SshRunner::run_shell) feeds a batch of commands, followed by `exit`, to an
//!   interactive shell and returns the transcript. Errors are returned to the caller.
//! * [`run_shell_enhanced`](SshRunner::run_shell_enhanced) does the same, but brackets every
//!   command with marker lines so that the transcript can be split back into per-command
//!   output (see [`demux`]).
//!
//! Each of them consumes the session it is given and closes it before returning, on every path.
//!
//! # Authentication
//!
//! Key-based authentication works as with plain `ssh`, with an optional dedicated key file. A
//! password can be given as well. It is answered through a private askpass helper, which
//! requires OpenSSH 8.4 or newer (or a `DISPLAY`).
//!
//! # Logging
//!
//! The crate reports through [`tracing`]. With [`RunnerConfig::verbose`] set, channel output
//! is echoed as it arrives (exec output at `INFO`, shell output at `DEBUG`). Installing a
//! subscriber is up to the application.
//!
//! # Examples
//!
//! ```rust,no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), ssh_runner::Error> {
//! use ssh_runner::{RunnerConfig, SshRunner};
//!
//! let mut runner = SshRunner::new(RunnerConfig::default());
//!
//! let session = runner.connect("me", "ssh.example.com", 22, None).await?;
//! let uname = runner.run_exec(session, "uname -a").await?;
//! println!("{} (exit {:?})", uname.output, uname.exit_code);
//!
//! let session = runner.connect("me", "ssh.example.com", 22, None).await?;
//! let mut outputs = runner
//!     .run_shell_enhanced(session, &["cd /var/log", "ls | head -n 3"])
//!     .await?;
//! for line in outputs.take("ls | head -n 3") {
//!     println!("{}", line);
//! }
//! # Ok(()) }
//! ```
//!
//!   [`ControlMaster`]: https://en.wikibooks.org/wiki/OpenSSH/Cookbook/Multiplexing

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod builder;
pub use builder::{KnownHosts, SessionBuilder};

mod session;
pub use session::Session;

mod command;
pub use command::Command;

mod child;
pub use child::RemoteChild;

mod channel;
pub use channel::{Channel, ChannelKind, CHUNK_SIZE};

mod error;
pub use error::Error;

mod config;
pub use config::{ConfigError, ErrorPolicy, RunnerConfig};

mod outcome;
pub use outcome::{Outcome, EXIT_CODE_UNSET};

pub mod demux;
pub use demux::CommandOutputs;

mod runner;
pub use runner::SshRunner;
