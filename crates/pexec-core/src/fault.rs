//! Fault taxonomy: the host-visible error outcomes of the engine.

use std::fmt;

/// A captured, truncated copy of a stream. Large captures are truncated
/// with a trailing note rather than carried in full inside an error value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

const CAPTURE_FAULT_LIMIT: usize = 32 * 1024;

impl CapturedOutput {
    pub fn from_full(bytes: Vec<u8>) -> Self {
        if bytes.len() <= CAPTURE_FAULT_LIMIT {
            Self {
                bytes,
                truncated: false,
            }
        } else {
            let mut truncated = bytes;
            truncated.truncate(CAPTURE_FAULT_LIMIT);
            Self {
                bytes: truncated,
                truncated: true,
            }
        }
    }

    fn write_preview(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = String::from_utf8_lossy(&self.bytes);
        write!(f, "{preview}")?;
        if self.truncated {
            write!(f, "\n... (truncated, {} bytes captured)", self.bytes.len())?;
        }
        Ok(())
    }
}

/// Host-visible error outcome from the engine.
#[derive(thiserror::Error, Debug)]
pub enum Fault {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("usage error: {0}")]
    UsageFault(String),

    #[error("fork/exec setup failed for `{command}`: {source}")]
    ForkFault {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code} (not in ok_code)\n--- stdout ---\n{}\n--- stderr ---\n{}", format_capture(.stdout), format_capture(.stderr))]
    ErrorReturnFault {
        command: String,
        code: i32,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
    },

    #[error("`{command}` was killed by signal {signal} ({})", signal_name(*.signal))]
    SignalFault { command: String, signal: i32 },

    #[error("`{command}` timed out and was sent signal {signal} ({})", signal_name(*.signal))]
    TimeoutFault { command: String, signal: i32 },

    #[error("failed to decode `{command}` output as text: {source}")]
    DecodeFault {
        command: String,
        #[source]
        source: std::str::Utf8Error,
    },
}

fn format_capture(capture: &CapturedOutput) -> String {
    struct Preview<'a>(&'a CapturedOutput);
    impl fmt::Display for Preview<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.write_preview(f)
        }
    }
    Preview(capture).to_string()
}

/// Map a POSIX signal number to its conventional name, for `Display` and so
/// faults can be matched either by number or by name. Falls back to a
/// numeric label for signals outside the common disposable-signal set.
pub fn signal_name(sig: i32) -> &'static str {
    match sig {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        10 => "SIGUSR1",
        11 => "SIGSEGV",
        12 => "SIGUSR2",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        17 => "SIGCHLD",
        18 => "SIGCONT",
        19 => "SIGSTOP",
        20 => "SIGTSTP",
        21 => "SIGTTIN",
        22 => "SIGTTOU",
        23 => "SIGURG",
        24 => "SIGXCPU",
        25 => "SIGXFSZ",
        26 => "SIGVTALRM",
        27 => "SIGPROF",
        30 => "SIGUSR1",
        _ => "SIG?",
    }
}

impl Fault {
    /// Fault precedence used when multiple stages of a pipeline fault:
    /// `TimeoutFault` wins over everything; otherwise the first non-ok
    /// stage wins.
    pub fn precedence(&self) -> u8 {
        match self {
            Fault::TimeoutFault { .. } => 0,
            Fault::SignalFault { .. } => 1,
            Fault::ErrorReturnFault { .. } => 2,
            Fault::ForkFault { .. } => 3,
            Fault::CommandNotFound(_) => 4,
            Fault::UsageFault(_) => 5,
            Fault::DecodeFault { .. } => 6,
        }
    }
}

/// Pick the fault that should win when a pipeline has faults from more
/// than one stage (`TimeoutFault` beats `ErrorReturnFault`; otherwise
/// leftmost/first-seen wins).
pub fn pick_pipeline_fault(faults: Vec<Fault>) -> Option<Fault> {
    faults
        .into_iter()
        .enumerate()
        .min_by_key(|(idx, fault)| (fault.precedence(), *idx))
        .map(|(_, fault)| fault)
}
