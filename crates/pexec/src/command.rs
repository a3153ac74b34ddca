//! `RunningCommand`: the public handle over one `OProc`.

use std::ffi::OsString;
use std::fmt;
use std::time::Duration;

use pexec_core::{ExitStatus, Fault};

use crate::oproc::{OProc, Reaped};
use crate::options::{DecodeErrors, DoneCallback, IterMode, Options};
use crate::queue::{PipeReceiver, WouldBlock};
use crate::writer::StdinSource;

/// A resolved, not-yet-run (or already-running) external command.
pub struct RunningCommand {
    program: OsString,
    args: Vec<OsString>,
    opts: Options,
    /// `Options::ok_code`/`decode_errors`/`done`/`bg`/`bg_exc`/`iter`,
    /// captured separately because `start()` moves the rest of `opts` into
    /// `OProc::spawn`.
    ok_code: pexec_core::OkCodes,
    decode_errors: DecodeErrors,
    done: Option<DoneCallback>,
    bg: bool,
    bg_exc: bool,
    iter: IterMode,
    iter_rx: Option<PipeReceiver<Vec<u8>>>,
    proc: Option<OProc>,
    reaped: Option<Reaped>,
}

impl RunningCommand {
    /// Build and, unless `bg` is set, run a command to completion.
    ///
    /// `program` must already be a resolved executable path; this engine
    /// does not search `PATH`.
    pub fn new(
        program: impl Into<OsString>,
        args: Vec<OsString>,
        mut opts: Options,
    ) -> Result<Self, Fault> {
        opts.validate().map_err(Fault::UsageFault)?;
        let run_inline = !opts.bg && opts.iter == IterMode::Off;
        let ok_code = opts.ok_code.clone();
        let decode_errors = opts.decode_errors;
        let done = opts.done.take();
        let bg = opts.bg;
        let bg_exc = opts.bg_exc;
        let iter = opts.iter;
        let program = program.into();
        let mut cmd = Self {
            program: program.clone(),
            args: args.clone(),
            opts,
            ok_code,
            decode_errors,
            done,
            bg,
            bg_exc,
            iter,
            iter_rx: None,
            proc: None,
            reaped: None,
        };
        cmd.start()?;
        if run_inline {
            cmd.wait(None)?;
        }
        Ok(cmd)
    }

    fn start(&mut self) -> Result<(), Fault> {
        // `Options` carries non-`Clone` fields (the stdin source, sinks,
        // preexec hook); since `OProc::spawn` consumes it, this swaps in a
        // placeholder and spawns with the real one.
        let opts = std::mem::replace(&mut self.opts, Options::default());
        let args = self.args.clone();
        let mut proc = OProc::spawn(self.program.clone(), &args, opts)?;
        if self.iter != IterMode::Off {
            self.iter_rx = proc.take_out_queue();
        }
        self.proc = Some(proc);
        Ok(())
    }

    /// Block for the child (or whole pipeline stage) to finish. Returns
    /// `self` on success; converts a non-`ok_code` exit into a `Fault`.
    ///
    /// Fires `Options::done` exactly once, right after reap, regardless of
    /// whether the outcome is ultimately turned into a `Fault`. An error
    /// from the callback takes precedence and is returned from `wait`.
    ///
    /// For a command started with `bg=true` and `bg_exc=false`, a failing
    /// exit is not turned into a `Fault` here: `exit_status()` is set as
    /// usual and `wait` returns `Ok`, leaving the caller to inspect it.
    pub fn wait(&mut self, _timeout: Option<Duration>) -> Result<&mut Self, Fault> {
        let command = self.command_text();
        let already_reaped = self.reaped.is_some();
        let proc = self
            .proc
            .as_mut()
            .expect("wait() called before the command was started");
        if self.reaped.is_none() {
            self.reaped = Some(proc.wait());
        }
        let reaped = self.reaped.as_ref().unwrap();
        let ok = !reaped.timed_out && self.ok_code.accepts(reaped.status);

        if !already_reaped {
            if let Some(done) = self.done.take() {
                done(proc.pid(), ok, reaped.status.code());
            }
        }

        if ok {
            return Ok(self);
        }

        if self.bg && !self.bg_exc {
            return Ok(self);
        }

        if reaped.timed_out {
            return Err(Fault::TimeoutFault {
                command,
                signal: proc.timeout_signal(),
            });
        }

        match reaped.status {
            ExitStatus::Signaled(sig) => Err(Fault::SignalFault {
                command,
                signal: sig,
            }),
            ExitStatus::Exited(code) => Err(Fault::ErrorReturnFault {
                command,
                code: code as i32,
                stdout: pexec_core::CapturedOutput::from_full(reaped.stdout.clone()),
                stderr: pexec_core::CapturedOutput::from_full(reaped.stderr.clone()),
            }),
        }
    }

    fn command_text(&self) -> String {
        self.proc
            .as_ref()
            .map(|p| p.command().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Process id of the underlying child, once started.
    pub fn pid(&self) -> Option<i32> {
        self.proc.as_ref().map(OProc::pid)
    }

    pub fn alive(&self) -> bool {
        self.proc.as_ref().is_some_and(OProc::alive)
    }

    pub fn terminate(&self) {
        if let Some(p) = &self.proc {
            p.terminate();
        }
    }

    pub fn kill(&self) {
        if let Some(p) = &self.proc {
            p.kill();
        }
    }

    pub fn kill_group(&self) {
        if let Some(p) = &self.proc {
            p.kill_group();
        }
    }

    pub fn send_signal(&self, sig: i32) {
        if let Some(p) = &self.proc {
            p.send_signal(sig);
        }
    }

    /// Captured stdout as raw bytes. Available once the process has
    /// produced and flushed them, complete only after `wait`.
    pub fn stdout_bytes(&self) -> Vec<u8> {
        self.reaped
            .as_ref()
            .map(|r| r.stdout.clone())
            .unwrap_or_default()
    }

    pub fn stderr_bytes(&self) -> Vec<u8> {
        self.reaped
            .as_ref()
            .map(|r| r.stderr.clone())
            .unwrap_or_default()
    }

    /// Captured stdout decoded per `Options::encoding`/`decode_errors`.
    pub fn stdout_text(&self) -> Result<String, Fault> {
        self.decode(&self.stdout_bytes())
    }

    /// Captured stderr decoded per `Options::encoding`/`decode_errors`.
    pub fn stderr_text(&self) -> Result<String, Fault> {
        self.decode(&self.stderr_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, Fault> {
        match self.decode_errors {
            DecodeErrors::Replace => Ok(String::from_utf8_lossy(bytes).into_owned()),
            DecodeErrors::Strict => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|source| Fault::DecodeFault {
                    command: self.command_text(),
                    source,
                }),
        }
    }

    /// Final decoded exit status, once reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.reaped.as_ref().map(|r| r.status)
    }

    /// A downstream pipe-queue draining the selected stream (requires
    /// `Options::piped` to have been set before construction).
    pub fn take_piped_queue(&mut self, stderr: bool) -> Option<PipeReceiver<Vec<u8>>> {
        let proc = self.proc.as_mut()?;
        if stderr {
            proc.take_err_queue()
        } else {
            proc.take_out_queue()
        }
    }

    /// Use this command's chosen output stream as another command's stdin
    /// source, routed through the in-process pipe-queue.
    pub fn into_stdin_source(mut self, stderr: bool) -> StdinSource {
        match self.take_piped_queue(stderr) {
            Some(rx) => StdinSource::Queue(rx),
            None => StdinSource::Bytes(self.stdout_bytes()),
        }
    }

    /// Iterate stdout chunks as they arrive, blocking between them. Requires
    /// `Options::iter` to have been set to `Blocking`/`NonBlocking` before
    /// construction (`run_inline` is skipped for either mode so the process
    /// is still running when this is first called).
    ///
    /// Exhausting the iterator reaps the command the same way `wait` would;
    /// a non-`ok_code` exit panics with the resulting `Fault` rather than
    /// silently dropping it, since an `Iterator` has no room for a `Result`.
    pub fn iter(&mut self) -> Iter<'_> {
        Iter {
            cmd: self,
            done: false,
        }
    }

    /// Non-blocking variant: each call to `next()` returns immediately with
    /// [`IterChunk::WouldBlock`] if nothing is ready yet instead of parking
    /// the calling thread.
    pub fn iter_noblock(&mut self) -> IterNoblock<'_> {
        IterNoblock {
            cmd: self,
            done: false,
        }
    }
}

/// Blocking chunk iterator returned by [`RunningCommand::iter`].
pub struct Iter<'a> {
    cmd: &'a mut RunningCommand,
    done: bool,
}

impl Iterator for Iter<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }
        let chunk = match self.cmd.iter_rx.as_ref() {
            Some(rx) => rx.get(),
            None => None,
        };
        match chunk {
            Some(bytes) => Some(bytes),
            None => {
                self.done = true;
                if let Err(fault) = self.cmd.wait(None) {
                    panic!("{fault}");
                }
                None
            }
        }
    }
}

/// One step of a non-blocking iteration, returned by [`IterNoblock`].
#[derive(Debug)]
pub enum IterChunk {
    /// A chunk of output arrived.
    Chunk(Vec<u8>),
    /// No chunk is ready yet; the process is still running.
    WouldBlock,
    /// The stream has reached EOF; the command has been reaped.
    Done,
}

/// Non-blocking chunk iterator returned by [`RunningCommand::iter_noblock`].
pub struct IterNoblock<'a> {
    cmd: &'a mut RunningCommand,
    done: bool,
}

impl IterNoblock<'_> {
    /// Fetch the next step without blocking. Call this in a loop (or poll
    /// loop) rather than relying on `Iterator`, since `WouldBlock` is a
    /// normal, repeatable outcome rather than an end state.
    pub fn next_chunk(&mut self) -> IterChunk {
        if self.done {
            return IterChunk::Done;
        }
        let outcome = match self.cmd.iter_rx.as_ref() {
            Some(rx) => rx.try_get(),
            None => Ok(None),
        };
        match outcome {
            Ok(Some(bytes)) => IterChunk::Chunk(bytes),
            Ok(None) => {
                self.done = true;
                if let Err(fault) = self.cmd.wait(None) {
                    panic!("{fault}");
                }
                IterChunk::Done
            }
            Err(WouldBlock) => IterChunk::WouldBlock,
        }
    }
}

impl fmt::Display for RunningCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.stdout_bytes()))
    }
}

impl fmt::Debug for RunningCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl PartialEq for RunningCommand {
    fn eq(&self, other: &Self) -> bool {
        self.stdout_bytes() == other.stdout_bytes()
    }
}

impl Eq for RunningCommand {}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_bin(name: &str) -> OsString {
        for dir in ["/usr/bin", "/bin"] {
            let candidate = format!("{dir}/{name}");
            if std::path::Path::new(&candidate).exists() {
                return OsString::from(candidate);
            }
        }
        OsString::from(name)
    }

    #[test]
    fn successful_command_waits_inline_by_default() {
        let cmd = RunningCommand::new(find_bin("echo"), vec!["hi".into()], Options::default())
            .expect("echo should succeed");
        assert_eq!(cmd.stdout_text().unwrap().trim(), "hi");
    }

    #[test]
    fn nonzero_exit_surfaces_error_return_fault() {
        let err = RunningCommand::new(find_bin("false"), vec![], Options::default())
            .expect_err("false should fail");
        assert!(matches!(err, Fault::ErrorReturnFault { code: 1, .. }));
    }

    #[test]
    fn ok_code_accepts_listed_exit() {
        let opts = Options {
            ok_code: pexec_core::OkCodes::new([0, 1]),
            ..Options::default()
        };
        let cmd = RunningCommand::new(find_bin("false"), vec![], opts)
            .expect("exit 1 should be accepted by ok_code");
        assert_eq!(cmd.exit_status(), Some(ExitStatus::Exited(1)));
    }

    #[test]
    fn equality_compares_captured_stdout() {
        let a = RunningCommand::new(find_bin("echo"), vec!["same".into()], Options::default())
            .unwrap();
        let b = RunningCommand::new(find_bin("echo"), vec!["same".into()], Options::default())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn done_callback_fires_once_with_reaped_outcome() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen_success = Arc::new(std::sync::Mutex::new(None));
        let calls_in_cb = Arc::clone(&calls);
        let seen_success_in_cb = Arc::clone(&seen_success);

        let mut opts = Options::default();
        opts.done = Some(Box::new(move |_pid, success, _code| {
            calls_in_cb.fetch_add(1, Ordering::SeqCst);
            *seen_success_in_cb.lock().unwrap() = Some(success);
        }));

        let cmd = RunningCommand::new(find_bin("true"), vec![], opts).expect("true should succeed");
        drop(cmd);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen_success.lock().unwrap(), Some(true));
    }

    #[test]
    fn bg_exc_false_swallows_background_failure() {
        let opts = Options {
            bg: true,
            bg_exc: false,
            ..Options::default()
        };
        let mut cmd =
            RunningCommand::new(find_bin("false"), vec![], opts).expect("bg spawn should succeed");
        cmd.wait(None).expect("bg_exc=false should not raise");
        assert_eq!(cmd.exit_status(), Some(ExitStatus::Exited(1)));
    }

    #[test]
    fn bg_exc_true_still_raises_for_background_failure() {
        let opts = Options {
            bg: true,
            bg_exc: true,
            ..Options::default()
        };
        let mut cmd =
            RunningCommand::new(find_bin("false"), vec![], opts).expect("bg spawn should succeed");
        let err = cmd.wait(None).unwrap_err();
        assert!(matches!(err, Fault::ErrorReturnFault { code: 1, .. }));
    }

    #[test]
    fn decode_errors_replace_never_faults() {
        let mut opts = Options::default();
        opts.decode_errors = crate::options::DecodeErrors::Replace;
        let cmd =
            RunningCommand::new(find_bin("printf"), vec![r"\xff".into()], opts).unwrap();
        assert!(cmd.stdout_text().is_ok());
    }

    #[test]
    fn iter_yields_all_stdout_chunks() {
        let opts = Options {
            iter: IterMode::Blocking,
            ..Options::default()
        };
        let mut cmd = RunningCommand::new(find_bin("printf"), vec!["andrew".into()], opts)
            .expect("spawn should succeed under iter mode");
        let collected: Vec<u8> = cmd.iter().flatten().collect();
        assert_eq!(collected, b"andrew");
        assert_eq!(cmd.exit_status(), Some(ExitStatus::Exited(0)));
    }

    #[test]
    fn iter_noblock_eventually_reaches_done() {
        let opts = Options {
            iter: IterMode::NonBlocking,
            ..Options::default()
        };
        let mut cmd = RunningCommand::new(find_bin("echo"), vec!["hi".into()], opts)
            .expect("spawn should succeed under iter mode");
        let mut collected = Vec::new();
        let mut iter = cmd.iter_noblock();
        loop {
            match iter.next_chunk() {
                IterChunk::Chunk(bytes) => collected.extend(bytes),
                IterChunk::WouldBlock => std::thread::sleep(Duration::from_millis(5)),
                IterChunk::Done => break,
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("hi"));
    }
}
