//! Exit-code model: the `ok_code` set and signal-exit encoding.

use std::collections::HashSet;

/// A decoded child exit outcome: a normal exit carries its status byte
/// `[0, 255]`; a signal exit is encoded as the negated signal number so a
/// single `i32` can represent both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ExitStatus {
    /// Process called `exit(code)` or returned from `main`.
    Exited(u8),
    /// Process was terminated by a signal.
    Signaled(i32),
}

impl ExitStatus {
    /// Encode as the signed integer the rest of the engine (and callers)
    /// compare against `ok_code`: non-negative for a normal exit, negative
    /// signal number for a signal exit.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code as i32,
            ExitStatus::Signaled(sig) => -sig,
        }
    }

    /// True if this outcome represents a normal exit with status 0.
    pub fn is_success(self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

/// The set of exit codes a caller considers non-error.
///
/// Defaults to `{0}`. Negative entries accept a signal exit of that signal
/// number as non-fatal (e.g. `-9` accepts `SIGKILL`).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OkCodes(HashSet<i32>);

impl Default for OkCodes {
    fn default() -> Self {
        Self(HashSet::from([0]))
    }
}

impl OkCodes {
    /// Build an `OkCodes` set from an explicit list of accepted codes.
    pub fn new(codes: impl IntoIterator<Item = i32>) -> Self {
        Self(codes.into_iter().collect())
    }

    /// Accept exactly one additional code, without disturbing the rest of
    /// the set. Useful for builder-style composition in `Options`.
    pub fn with(mut self, code: i32) -> Self {
        self.0.insert(code);
        self
    }

    pub fn contains(&self, code: i32) -> bool {
        self.0.contains(&code)
    }

    /// Whether the given decoded exit outcome is acceptable per this set.
    pub fn accepts(&self, status: ExitStatus) -> bool {
        self.contains(status.code())
    }
}

impl FromIterator<i32> for OkCodes {
    fn from_iter<T: IntoIterator<Item = i32>>(iter: T) -> Self {
        Self::new(iter)
    }
}
