//! Recover per-command output from the transcript of a batched shell run.
//!
//! A shell channel hands back one undelimited stream for every command it ran. To find out
//! which lines belong to which command, each command is bracketed by two `echo` lines before
//! the batch is sent (see [`wrap_commands`]):
//!
//! ```text
//! echo @START<i>@T= $( date +%T )
//! <command i>
//! echo @END<i>@T= $( date +%T )
//! ```
//!
//! and [`CommandOutputs::parse`] looks for the echoed markers in the resulting transcript.

use std::collections::BTreeMap;

/// The unexpanded clock suffix of a marker command.
///
/// The marker's real output carries the expanded time instead.
const MARKER_CLOCK: &str = "$( date +%T )";

fn start_marker(index: usize) -> String {
    format!("@START{}@", index)
}

fn end_marker(index: usize) -> String {
    format!("@END{}@", index)
}

/// Whether `line` is a marker command echoed back by a pseudo-terminal, i.e. it holds
/// `@START<k>@T= $( date +%T )` or `@END<k>@T= $( date +%T )` for some index `k`.
///
/// A pty echoes the whole batch as it is written, so the echo of a later marker may land
/// inside an earlier command's bucket. Any index counts.
fn is_marker_echo(line: &str) -> bool {
    ["@START", "@END"].iter().any(|tag| {
        line.match_indices(tag).any(|(at, _)| {
            let rest = &line[at + tag.len()..];
            let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            digits > 0
                && rest[digits..]
                    .strip_prefix("@T= ")
                    .map_or(false, |clock| clock.starts_with(MARKER_CLOCK))
        })
    })
}

/// Bracket every command with start and end marker lines, ready for
/// [`SshRunner::run_shell`](crate::SshRunner::run_shell).
pub fn wrap_commands<S: AsRef<str>>(commands: &[S]) -> Vec<String> {
    let mut wrapped = Vec::with_capacity(commands.len() * 3);
    for (i, command) in commands.iter().enumerate() {
        wrapped.push(format!("echo {}T= {}", start_marker(i), MARKER_CLOCK));
        wrapped.push(command.as_ref().to_owned());
        wrapped.push(format!("echo {}T= {}", end_marker(i), MARKER_CLOCK));
    }
    wrapped
}

/// Split raw channel output into transcript lines.
///
/// Carriage returns and tabs are removed before splitting on line feeds, and trailing empty
/// lines are dropped.
pub fn clean_output(output: &str) -> Vec<String> {
    let cleaned: String = output.chars().filter(|c| !matches!(c, '\r' | '\t')).collect();
    let mut lines: Vec<String> = cleaned.split('\n').map(str::to_owned).collect();
    while lines.last().map_or(false, |l| l.is_empty()) {
        lines.pop();
    }
    lines
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the start marker of command `i`. Lines seen here belong to nobody.
    AwaitingStart(usize),
    /// Between the start and end marker of command `i`.
    InCommand(usize),
}

impl State {
    fn index(self) -> usize {
        match self {
            State::AwaitingStart(i) | State::InCommand(i) => i,
        }
    }
}

/// Output lines of a shell batch, bucketed by the index of the command that produced them.
///
/// Each bucket holds the command text followed by that command's output lines. The command
/// text is stripped again by the accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutputs {
    buckets: BTreeMap<usize, Vec<String>>,
}

impl CommandOutputs {
    /// Bucket the lines of `transcript` by the markers of [`wrap_commands`].
    ///
    /// `commands` are the commands as submitted, before wrapping. Missing or out-of-order
    /// markers leave the affected commands without a bucket, or with a short one. They are
    /// never an error.
    pub fn parse<S: AsRef<str>>(commands: &[S], transcript: &str) -> Self {
        let mut buckets: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut state = State::AwaitingStart(0);

        for line in clean_output(transcript) {
            let i = state.index();
            if i >= commands.len() {
                break;
            }
            if is_marker_echo(&line) {
                continue;
            }

            if line.contains(&start_marker(i)) {
                buckets.insert(i, vec![commands[i].as_ref().to_owned()]);
                state = State::InCommand(i);
            } else if line.contains(&end_marker(i)) {
                state = State::AwaitingStart(i + 1);
            } else if let State::InCommand(i) = state {
                if let Some(bucket) = buckets.get_mut(&i) {
                    bucket.push(line);
                }
            }
        }

        Self { buckets }
    }

    /// Number of commands that have a bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no command has a bucket.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Output lines of the command at `index`, without consuming them.
    pub fn get(&self, index: usize) -> Option<&[String]> {
        self.buckets.get(&index).map(|bucket| &bucket[1..])
    }

    /// Iterate over `(index, command, output lines)` in submission order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str, &[String])> + '_ {
        self.buckets
            .iter()
            .map(|(&i, bucket)| (i, bucket[0].as_str(), &bucket[1..]))
    }

    /// Remove and return the output lines of the first command whose text is exactly
    /// `command`.
    ///
    /// Looking up by text is ambiguous when the same command was submitted more than once.
    /// The lowest-index bucket wins, and since it is consumed, the next lookup finds the next
    /// occurrence. An unknown or already consumed command yields no lines.
    pub fn take(&mut self, command: &str) -> Vec<String> {
        let index = self
            .buckets
            .iter()
            .find(|(_, bucket)| bucket[0] == command)
            .map(|(&i, _)| i);

        match index.and_then(|i| self.buckets.remove(&i)) {
            Some(mut bucket) => {
                bucket.remove(0);
                bucket
            }
            None => Vec::new(),
        }
    }
}
