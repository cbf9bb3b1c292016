use super::demux::clean_output;

/// Exit code reported in place of a status that no invocation has set.
pub const EXIT_CODE_UNSET: i32 = -999;

/// What one exec or shell invocation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Everything the channel wrote to its output stream, lossily decoded as UTF-8.
    pub output: String,
    /// The channel's exit status, or `None` when the invocation could not observe one.
    ///
    /// A bounded-wait shell run never observes one, and neither does a best-effort exec
    /// that failed.
    pub exit_code: Option<i32>,
}

impl Outcome {
    pub(crate) fn new(output: Vec<u8>, exit_code: Option<i32>) -> Self {
        Self {
            output: String::from_utf8_lossy(&output).into_owned(),
            exit_code,
        }
    }

    /// The empty result a best-effort run falls back to.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The output as a transcript, see [`clean_output`].
    pub fn lines(&self) -> Vec<String> {
        clean_output(&self.output)
    }

    /// Whether the invocation reported an exit status of zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The exit status, or [`EXIT_CODE_UNSET`] along with a warning when there is none.
    pub fn exit_code_or_sentinel(&self) -> i32 {
        exit_code_or_warn(self.exit_code)
    }
}

pub(crate) fn exit_code_or_warn(code: Option<i32>) -> i32 {
    match code {
        Some(code) => code,
        None => {
            tracing::warn!(
                "exit code was not set by the last action, reporting {}",
                EXIT_CODE_UNSET
            );
            EXIT_CODE_UNSET
        }
    }
}
