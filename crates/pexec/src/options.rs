//! `Options`: the call-options record.
//!
//! A single struct carrying defaults and closed-set enums in place of an
//! open keyword-argument bag, in the spirit of `csa-process::SpawnOptions`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use pexec_core::OkCodes;

use crate::buffering::Bufsize;
use crate::reader::Sink;
use crate::writer::StdinSource;

/// Which captured stream should feed a downstream pipe-queue or iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Piped {
    #[default]
    None,
    Out,
    Err,
}

/// Which stream(s) should be tee'd to their sink in addition to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tee {
    #[default]
    None,
    Out,
    Err,
    Both,
}

impl Tee {
    pub fn tees_stdout(self) -> bool {
        matches!(self, Tee::Out | Tee::Both)
    }

    pub fn tees_stderr(self) -> bool {
        matches!(self, Tee::Err | Tee::Both)
    }
}

/// Lazy-sequence presentation mode for a RunningCommand's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterMode {
    #[default]
    Off,
    Blocking,
    NonBlocking,
}

/// How `RunningCommand::stdout_text`/`stderr_text` handle bytes that are
/// not valid under `Options::encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeErrors {
    /// Return a `DecodeFault` on the first invalid byte sequence.
    #[default]
    Strict,
    /// Substitute U+FFFD for invalid sequences and always succeed.
    Replace,
}

/// A callback fired exactly once, after reap, carrying
/// `(pid, success, exit_code)` where `success` is whether the exit landed
/// in `ok_code`.
pub type DoneCallback = Box<dyn FnOnce(i32, bool, i32) + Send>;

/// The call-options record. Every field defaults to the documented
/// behavior; build one with `Options::default()` and override only what
/// you need.
pub struct Options {
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub stdin: Option<StdinSource>,
    pub stdout: Option<Sink>,
    pub stderr: Option<Sink>,
    pub err_to_out: bool,
    pub tty_in: bool,
    pub tty_out: bool,
    pub bg: bool,
    pub bg_exc: bool,
    pub timeout: Option<Duration>,
    pub timeout_signal: i32,
    pub ok_code: OkCodes,
    pub piped: Piped,
    pub tee: Tee,
    pub iter: IterMode,
    pub in_bufsize: Bufsize,
    pub out_bufsize: Bufsize,
    pub err_bufsize: Bufsize,
    pub internal_bufsize: usize,
    pub new_session: bool,
    pub new_group: bool,
    pub close_fds: bool,
    pub pass_fds: Vec<i32>,
    pub preexec_fn: Option<Box<dyn Fn() -> std::io::Result<()> + Send + Sync>>,
    pub no_out: bool,
    pub no_err: bool,
    pub no_pipe: bool,
    pub fg: bool,
    pub persist: bool,
    pub encoding: String,
    pub decode_errors: DecodeErrors,
    pub done: Option<DoneCallback>,
}

/// `SIGKILL`, the default timeout-enforcement signal.
pub const DEFAULT_TIMEOUT_SIGNAL: i32 = 9;

/// Default bound on the in-memory capture deques.
pub const DEFAULT_INTERNAL_BUFSIZE: usize = 100_000;

impl Default for Options {
    fn default() -> Self {
        Self {
            cwd: None,
            env: None,
            stdin: None,
            stdout: None,
            stderr: None,
            err_to_out: false,
            tty_in: false,
            tty_out: false,
            bg: false,
            bg_exc: true,
            timeout: None,
            timeout_signal: DEFAULT_TIMEOUT_SIGNAL,
            ok_code: OkCodes::default(),
            piped: Piped::default(),
            tee: Tee::default(),
            iter: IterMode::default(),
            in_bufsize: Bufsize::Unbuffered,
            out_bufsize: Bufsize::Chunk(4096),
            err_bufsize: Bufsize::Chunk(4096),
            internal_bufsize: DEFAULT_INTERNAL_BUFSIZE,
            new_session: false,
            new_group: false,
            close_fds: true,
            pass_fds: Vec::new(),
            preexec_fn: None,
            no_out: false,
            no_err: false,
            no_pipe: false,
            fg: false,
            persist: false,
            encoding: DEFAULT_ENCODING.to_string(),
            decode_errors: DecodeErrors::default(),
            done: None,
        }
    }
}

/// Default text encoding for `stdout_text`/`stderr_text`. Only `utf-8` is
/// actually decoded; other values are accepted and carried through for
/// parity with the documented option but fall back to UTF-8 decoding.
pub const DEFAULT_ENCODING: &str = "utf-8";

impl Options {
    /// Validate the mutual-exclusion rules between option fields, returning
    /// a `UsageFault`-shaped message on violation. Called once at
    /// `RunningCommand` construction.
    pub fn validate(&self) -> Result<(), String> {
        if self.fg && (self.stdout.is_some() || self.stderr.is_some() || self.stdin.is_some()) {
            return Err("fg is mutually exclusive with stdout/stderr/stdin".to_string());
        }
        if self.iter != IterMode::Off && self.piped != Piped::None {
            return Err("iter is mutually exclusive with piped".to_string());
        }
        if self.err_to_out && self.stderr.is_some() {
            return Err("err_to_out is mutually exclusive with an explicit stderr sink".to_string());
        }
        Ok(())
    }
}
