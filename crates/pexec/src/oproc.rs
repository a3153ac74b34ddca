//! `OProc`: one forked/exec'd child, its descriptor topology, and the
//! single io thread that drives its streams to completion.

use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command as StdCommand, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use pexec_core::{ExitStatus, Fault};

use crate::options::{IterMode, Options, Piped};
use crate::pty::{self, PtyPair};
use crate::queue::{PipeReceiver, PipeSender, channel};
use crate::reader::{CaptureBuffer, OProcHandle, RendezvousGate, Sink, StdinQueueHandle, StreamReader};
use crate::registry;
use crate::writer::{StdinSource, StreamWriter, WriteStep};

/// Parent-side endpoint of a channel wired to one of the child's standard
/// descriptors: either a pty pair (so the engine can disable terminal
/// translation) or a plain OS pipe.
enum Channel {
    Pty(PtyPair),
    Pipe { read: OwnedFd, write: OwnedFd },
}

impl Channel {
    fn slave_fd(&self) -> RawFd {
        match self {
            Channel::Pty(pair) => pair.slave.as_raw_fd(),
            Channel::Pipe { write, .. } => write.as_raw_fd(),
        }
    }

    /// Consume the channel, returning the descriptor the parent keeps
    /// (master side for a pty, the opposite end for a pipe) after
    /// dropping the slave/child-facing side.
    fn into_parent_fd(self) -> OwnedFd {
        match self {
            Channel::Pty(pair) => {
                drop(pair.slave);
                pair.master
            }
            Channel::Pipe { read, write } => {
                drop(write);
                read
            }
        }
    }
}

/// Dup the channel's slave fd into a `Stdio` the child process inherits.
/// The original descriptor stays owned by the `Channel` for the parent to
/// later turn into `into_parent_fd`.
fn slave_stdio(channel: &Channel) -> io::Result<Stdio> {
    let dup_fd = nix::unistd::dup(channel.slave_fd()).map_err(io::Error::from)?;
    // SAFETY: `dup_fd` was just created by `dup` above and is owned here;
    // `Stdio` takes ownership and closes it when the child's spawn setup
    // is done with it.
    Ok(unsafe { Stdio::from_raw_fd(dup_fd) })
}

/// Outcome of a completed `OProc`, captured once and handed to `wait`.
pub struct Reaped {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// A single forked/exec'd child process and its io thread.
pub struct OProc {
    pid: Pid,
    pgid: i32,
    command: String,
    exit_status: Arc<Mutex<Option<ExitStatus>>>,
    wait_lock: Arc<Mutex<()>>,
    io_thread: Option<std::thread::JoinHandle<()>>,
    capture_out: Arc<Mutex<CaptureBuffer>>,
    capture_err: Arc<Mutex<CaptureBuffer>>,
    timed_out: Arc<AtomicBool>,
    timeout_signal: i32,
    stdin_tx: Option<PipeSender<Vec<u8>>>,
    out_rx: Option<PipeReceiver<Vec<u8>>>,
    err_rx: Option<PipeReceiver<Vec<u8>>>,
    persist: bool,
}

impl OProc {
    /// Fork and exec `program` with `args`, wiring streams per `opts`.
    /// Consumes `opts` since stdin sources and the preexec hook are moved
    /// into the child setup and the io thread.
    #[tracing::instrument(skip(opts, args), fields(command = %program.as_ref().to_string_lossy()))]
    pub fn spawn(
        program: impl AsRef<OsStr> + std::fmt::Debug,
        args: &[impl AsRef<OsStr>],
        mut opts: Options,
    ) -> Result<Self, Fault> {
        let command_text = render_command(program.as_ref(), args);
        let fork_fault = |source: io::Error| Fault::ForkFault {
            command: command_text.clone(),
            source,
        };

        if opts.fg {
            return Self::spawn_fg(program, args, opts, command_text);
        }

        // A raw-fd sink bypasses pty allocation entirely: the child's
        // descriptor is wired straight to the caller's fd and no
        // `StreamReader` is ever constructed for that stream.
        let stdout_fd = match &opts.stdout {
            Some(Sink::Fd(fd)) => Some(*fd),
            _ => None,
        };
        let stderr_fd = match &opts.stderr {
            Some(Sink::Fd(fd)) => Some(*fd),
            _ => None,
        };

        let stdin_channel = make_channel(opts.tty_in).map_err(|e| fork_fault(e.into()))?;
        let stdout_channel = if stdout_fd.is_none() {
            Some(make_channel(true).map_err(|e| fork_fault(e.into()))?)
        } else {
            None
        };
        let stderr_channel = if opts.err_to_out || stderr_fd.is_some() {
            None
        } else {
            Some(make_channel(true).map_err(|e| fork_fault(e.into()))?)
        };

        let mut cmd = StdCommand::new(program.as_ref());
        cmd.args(args.iter().map(|a| a.as_ref()));
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &opts.env {
            cmd.env_clear();
            cmd.envs(env);
        }

        cmd.stdin(slave_stdio(&stdin_channel).map_err(fork_fault)?);
        // `stdout_desc` is the fd number that will hold the child's stdout
        // once spawned, whichever form it takes; `err_to_out`'s pre_exec
        // dup2 needs that number regardless of which branch set it.
        let stdout_desc = match (&stdout_channel, stdout_fd) {
            (Some(ch), _) => {
                cmd.stdout(slave_stdio(ch).map_err(fork_fault)?);
                ch.slave_fd()
            }
            (None, Some(fd)) => {
                let dup_fd = nix::unistd::dup(fd).map_err(io::Error::from).map_err(fork_fault)?;
                // SAFETY: `dup_fd` was just created above and is owned here;
                // `Stdio` takes ownership and closes it once spawn setup is
                // done with it.
                cmd.stdout(unsafe { Stdio::from_raw_fd(dup_fd) });
                fd
            }
            (None, None) => unreachable!("stdout_channel is only None when a raw fd sink was requested"),
        };
        match (&stderr_channel, stderr_fd) {
            (Some(ch), _) => {
                cmd.stderr(slave_stdio(ch).map_err(fork_fault)?);
            }
            (None, Some(fd)) => {
                let dup_fd = nix::unistd::dup(fd).map_err(io::Error::from).map_err(fork_fault)?;
                // SAFETY: see stdout_desc above.
                cmd.stderr(unsafe { Stdio::from_raw_fd(dup_fd) });
            }
            (None, None) => {
                cmd.stderr(Stdio::null());
            }
        }

        let tty_in = opts.tty_in;
        let new_session = opts.new_session;
        let new_group = opts.new_group;
        let close_fds = opts.close_fds;
        let pass_fds = opts.pass_fds.clone();
        let err_to_out = opts.err_to_out;
        let stdin_slave_fd = stdin_channel.slave_fd();
        let stdout_slave_fd = stdout_desc;
        let preexec_fn = opts.preexec_fn.take();

        // SAFETY: `pre_exec` runs in the forked child before `exec`, using
        // only async-signal-safe calls (setsid, ioctl, setpgid, close) and
        // never touching shared Rust state across the fork.
        unsafe {
            cmd.pre_exec(move || {
                if tty_in {
                    if let Ok(tty_fd) = nix::fcntl::open(
                        "/dev/tty",
                        nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_NOCTTY,
                        nix::sys::stat::Mode::empty(),
                    ) {
                        let _ = nix::unistd::close(tty_fd);
                    }
                    nix::unistd::setsid().map_err(io::Error::from)?;
                    let rc = libc::ioctl(stdin_slave_fd, libc::TIOCSCTTY as _, 0);
                    if rc == -1 {
                        return Err(io::Error::last_os_error());
                    }
                } else if new_session {
                    nix::unistd::setsid().map_err(io::Error::from)?;
                } else if new_group {
                    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                        .map_err(io::Error::from)?;
                }

                if err_to_out {
                    let rc = libc::dup2(stdout_slave_fd, 2);
                    if rc == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }

                if close_fds {
                    close_inherited_fds(&pass_fds);
                }

                if let Some(preexec) = &preexec_fn {
                    preexec()?;
                }

                Ok(())
            });
        }

        let child = cmd.spawn().map_err(fork_fault)?;
        let pid = Pid::from_raw(child.id() as i32);
        tracing::debug!(pid = pid.as_raw(), command = %command_text, "spawned child");
        let pgid = if new_session || new_group || tty_in {
            pid.as_raw()
        } else {
            nix::unistd::getpgid(Some(pid))
                .map(|p| p.as_raw())
                .unwrap_or_else(|_| pid.as_raw())
        };
        // `child` only carries the pid onward (we never used
        // `Stdio::piped()`, so it has no handles to close or reap); it can
        // drop normally once `pid` has been read out of it.
        drop(child);

        if !opts.persist {
            registry::register(pid);
        }

        let stdin_master = stdin_channel.into_parent_fd();
        let stdout_master = stdout_channel.map(Channel::into_parent_fd);
        let stderr_master = stderr_channel.map(Channel::into_parent_fd);

        if let Some(m) = &stdout_master {
            pty::set_raw(m.as_raw_fd()).map_err(|e| fork_fault(e.into()))?;
        }
        if let Some(m) = &stderr_master {
            let _ = pty::set_raw(m.as_raw_fd());
        }
        if tty_in {
            let _ = pty::disable_echo(stdin_master.as_raw_fd());
        }

        // When the caller gave no explicit stdin source, default to an
        // internal queue so `ChunkStdinSink`/`ChunkStdinProcSink`
        // callbacks always have somewhere to push fresh input.
        let (stdin_source, stdin_tx) = match opts.stdin.take() {
            Some(source) => (source, None),
            None => {
                let (tx, rx) = channel::<Vec<u8>>(opts.internal_bufsize.max(1));
                (StdinSource::Queue(rx), Some(tx))
            }
        };
        let writer = StreamWriter::new(stdin_master, tty_in, stdin_source, true);

        // `no_out`/`no_err` suppress capture entirely for that stream;
        // a suppressed stream's buffer stays permanently empty.
        let capture_out = Arc::new(Mutex::new(if opts.no_out {
            CaptureBuffer::disabled()
        } else {
            CaptureBuffer::new(opts.internal_bufsize)
        }));
        let capture_err = Arc::new(Mutex::new(if opts.no_err {
            CaptureBuffer::disabled()
        } else {
            CaptureBuffer::new(opts.internal_bufsize)
        }));

        let proc_handle = OProcHandle::new(pid.as_raw(), pgid);
        let stdin_handle = StdinQueueHandle::new(stdin_tx.clone());

        // `no_pipe` additionally suppresses queueing even if `piped`/`iter`
        // asked for a downstream queue on that stream; a raw-fd sink has no
        // reader at all, so it can never feed one either.
        let want_out_queue = stdout_master.is_some()
            && (opts.piped == Piped::Out || opts.iter != IterMode::Off)
            && !opts.no_pipe
            && !opts.no_out;
        let (out_pipe_tx, out_rx) = if want_out_queue {
            let (tx, rx) = channel::<Vec<u8>>(64);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let want_err_queue =
            stderr_master.is_some() && opts.piped == Piped::Err && !opts.no_pipe && !opts.no_err;
        let (err_pipe_tx, err_rx) = if want_err_queue {
            let (tx, rx) = channel::<Vec<u8>>(64);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // Both readers must take their first scheduler tick before either
        // one's sink fires, so completed output on the error path never
        // arrives out of order; a stream with no reader at all (raw-fd
        // sink) doesn't count toward the rendezvous.
        let expected_readers = stdout_master.is_some() as usize + stderr_master.is_some() as usize;
        let gate = RendezvousGate::new(expected_readers);

        let out_reader = stdout_master.map(|fd| {
            let out_sink = opts.stdout.take().unwrap_or(Sink::Null);
            StreamReader::new(
                fd,
                opts.out_bufsize,
                out_sink,
                opts.tee.tees_stdout(),
                out_pipe_tx,
                stdin_handle.clone(),
                proc_handle,
                Arc::clone(&gate),
            )
        });
        let err_reader = stderr_master.map(|fd| {
            let err_sink = opts.stderr.take().unwrap_or(Sink::Null);
            StreamReader::new(
                fd,
                opts.err_bufsize,
                err_sink,
                opts.tee.tees_stderr(),
                err_pipe_tx,
                stdin_handle,
                proc_handle,
                gate,
            )
        });

        let exit_status = Arc::new(Mutex::new(None));
        let wait_lock = Arc::new(Mutex::new(()));
        let timed_out = Arc::new(AtomicBool::new(false));

        let io_handle = spawn_io_thread(IoThreadArgs {
            writer,
            out_reader,
            err_reader,
            capture_out: Arc::clone(&capture_out),
            capture_err: Arc::clone(&capture_err),
            pid,
            timeout: opts.timeout,
            timeout_signal: opts.timeout_signal,
            timed_out: Arc::clone(&timed_out),
        });

        Ok(Self {
            pid,
            pgid,
            command: command_text,
            exit_status,
            wait_lock,
            io_thread: Some(io_handle),
            capture_out,
            capture_err,
            timed_out,
            timeout_signal: opts.timeout_signal,
            stdin_tx,
            out_rx,
            err_rx,
            persist: opts.persist,
        })
    }

    /// Run `program` inheriting the parent's stdin/stdout/stderr instead of
    /// routing through a pty pair and io thread. `validate()` already
    /// rejects `fg` together with an explicit stdout/stderr/stdin sink, so
    /// there is never a sink or capture buffer to wire up here.
    fn spawn_fg(
        program: impl AsRef<OsStr>,
        args: &[impl AsRef<OsStr>],
        mut opts: Options,
        command_text: String,
    ) -> Result<Self, Fault> {
        let fork_fault = |source: io::Error| Fault::ForkFault {
            command: command_text.clone(),
            source,
        };
        let mut cmd = StdCommand::new(program.as_ref());
        cmd.args(args.iter().map(|a| a.as_ref()));
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &opts.env {
            cmd.env_clear();
            cmd.envs(env);
        }
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let new_session = opts.new_session;
        let new_group = opts.new_group;
        let close_fds = opts.close_fds;
        let pass_fds = opts.pass_fds.clone();
        let preexec_fn = opts.preexec_fn.take();

        // SAFETY: same contract as the piped spawn path's pre_exec above.
        unsafe {
            cmd.pre_exec(move || {
                if new_session {
                    nix::unistd::setsid().map_err(io::Error::from)?;
                } else if new_group {
                    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                        .map_err(io::Error::from)?;
                }
                if close_fds {
                    close_inherited_fds(&pass_fds);
                }
                if let Some(preexec) = &preexec_fn {
                    preexec()?;
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(fork_fault)?;
        let pid = Pid::from_raw(child.id() as i32);
        tracing::debug!(pid = pid.as_raw(), command = %command_text, "spawned fg child");
        let pgid = if new_session || new_group {
            pid.as_raw()
        } else {
            nix::unistd::getpgid(Some(pid))
                .map(|p| p.as_raw())
                .unwrap_or_else(|_| pid.as_raw())
        };
        drop(child);

        if !opts.persist {
            registry::register(pid);
        }

        let exit_status = Arc::new(Mutex::new(None));
        let timed_out = Arc::new(AtomicBool::new(false));

        if let Some(duration) = opts.timeout {
            let watch_pid = pid;
            let sig = opts.timeout_signal;
            let flag = Arc::clone(&timed_out);
            let reaped = Arc::clone(&exit_status);
            let _ = std::thread::Builder::new()
                .name("pexec-fg-timeout".to_string())
                .spawn(move || {
                    std::thread::sleep(duration);
                    if reaped.lock().unwrap().is_none() {
                        flag.store(true, Ordering::Relaxed);
                        tracing::warn!(pid = watch_pid.as_raw(), timeout_signal = sig, "command timed out");
                        let _ = signal::kill(watch_pid, Signal::try_from(sig).ok());
                    }
                });
        }

        Ok(Self {
            pid,
            pgid,
            command: command_text,
            exit_status,
            wait_lock: Arc::new(Mutex::new(())),
            io_thread: None,
            capture_out: Arc::new(Mutex::new(CaptureBuffer::disabled())),
            capture_err: Arc::new(Mutex::new(CaptureBuffer::disabled())),
            timed_out,
            timeout_signal: opts.timeout_signal,
            stdin_tx: None,
            out_rx: None,
            err_rx: None,
            persist: opts.persist,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn stdin_queue(&self) -> Option<PipeSender<Vec<u8>>> {
        self.stdin_tx.clone()
    }

    pub fn take_out_queue(&mut self) -> Option<PipeReceiver<Vec<u8>>> {
        self.out_rx.take()
    }

    pub fn take_err_queue(&mut self) -> Option<PipeReceiver<Vec<u8>>> {
        self.err_rx.take()
    }

    /// Non-blocking liveness check, guarded by the wait-lock so it never
    /// races a blocking reap in progress elsewhere.
    pub fn alive(&self) -> bool {
        let Ok(_guard) = self.wait_lock.try_lock() else {
            return true;
        };
        if self.exit_status.lock().unwrap().is_some() {
            return false;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                *self.exit_status.lock().unwrap() = Some(decode_exit(status));
                false
            }
            Err(_) => false,
        }
    }

    pub fn send_signal(&self, sig: i32) {
        tracing::debug!(pid = self.pid.as_raw(), sig, "sending signal");
        let _ = signal::kill(self.pid, Signal::try_from(sig).ok());
    }

    pub fn terminate(&self) {
        self.send_signal(Signal::SIGTERM as i32);
    }

    pub fn kill(&self) {
        self.send_signal(Signal::SIGKILL as i32);
    }

    pub fn kill_group(&self) {
        let _ = signal::killpg(Pid::from_raw(self.pgid), Signal::SIGKILL);
    }

    /// Block for the child and io thread to finish, returning the final
    /// reaped outcome. Idempotent: a second call returns the cached result.
    pub fn wait(&mut self) -> Reaped {
        let _guard = self.wait_lock.lock().unwrap();
        if let Some(thread) = self.io_thread.take() {
            let _ = thread.join();
        }
        let status = {
            let mut slot = self.exit_status.lock().unwrap();
            if slot.is_none() {
                if let Ok(status) = waitpid(self.pid, None) {
                    *slot = Some(decode_exit(status));
                }
            }
            slot.unwrap_or(ExitStatus::Exited(0))
        };
        if !self.persist {
            registry::deregister(self.pid);
        }
        tracing::debug!(pid = self.pid.as_raw(), ?status, "reaped child");
        Reaped {
            status,
            stdout: self.capture_out.lock().unwrap().to_vec(),
            stderr: self.capture_err.lock().unwrap().to_vec(),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }

    pub fn timeout_signal(&self) -> i32 {
        self.timeout_signal
    }
}

impl Drop for OProc {
    fn drop(&mut self) {
        if !self.persist {
            registry::deregister(self.pid);
        }
    }
}

fn make_channel(tty: bool) -> nix::Result<Channel> {
    if tty {
        pty::allocate().map(Channel::Pty)
    } else {
        let (read, write) = nix::unistd::pipe()?;
        Ok(Channel::Pipe { read, write })
    }
}

fn decode_exit(status: WaitStatus) -> ExitStatus {
    match status {
        WaitStatus::Exited(_, code) => ExitStatus::Exited(code as u8),
        WaitStatus::Signaled(_, sig, _) => ExitStatus::Signaled(sig as i32),
        _ => ExitStatus::Exited(0),
    }
}

fn render_command(program: &OsStr, args: &[impl AsRef<OsStr>]) -> String {
    let mut out = program.to_string_lossy().into_owned();
    for arg in args {
        out.push(' ');
        out.push_str(&arg.as_ref().to_string_lossy());
    }
    out
}

/// Remove every inherited fd at or above 3 except those the caller asked
/// to keep open, per `close_fds`/`pass_fds`.
fn close_inherited_fds(pass_fds: &[i32]) {
    let max_fd = nix::unistd::sysconf(nix::unistd::SysconfVar::OPEN_MAX)
        .ok()
        .flatten()
        .unwrap_or(1024) as i32;
    for fd in 3..max_fd {
        if !pass_fds.contains(&fd) {
            let _ = nix::unistd::close(fd);
        }
    }
}

struct IoThreadArgs {
    writer: StreamWriter,
    out_reader: Option<StreamReader>,
    err_reader: Option<StreamReader>,
    capture_out: Arc<Mutex<CaptureBuffer>>,
    capture_err: Arc<Mutex<CaptureBuffer>>,
    pid: Pid,
    timeout: Option<Duration>,
    timeout_signal: i32,
    timed_out: Arc<AtomicBool>,
}

enum FdRole {
    Writer,
    Out,
    Err,
}

fn spawn_io_thread(args: IoThreadArgs) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("pexec-io".to_string())
        .spawn(move || io_loop(args))
        .expect("failed to spawn pexec io thread")
}

/// Drive the writer and up to two readers with a single `poll(2)` loop
/// until every reader reports done, honoring an optional wall-clock
/// timeout.
fn io_loop(args: IoThreadArgs) {
    let IoThreadArgs {
        mut writer,
        mut out_reader,
        mut err_reader,
        capture_out,
        capture_err,
        pid,
        timeout,
        timeout_signal,
        timed_out,
    } = args;

    let deadline = timeout.map(|d| Instant::now() + d);
    let mut writer_done = false;

    loop {
        if out_reader.is_none() && err_reader.is_none() {
            break;
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline && !timed_out.load(Ordering::Relaxed) {
                timed_out.store(true, Ordering::Relaxed);
                tracing::warn!(pid = pid.as_raw(), timeout_signal, "command timed out");
                let _ = signal::kill(pid, Signal::try_from(timeout_signal).ok());
            }
        }

        let mut roles = Vec::new();
        let mut raw_fds = Vec::new();
        let mut flags = Vec::new();

        if !writer_done {
            raw_fds.push(writer.fd());
            flags.push(PollFlags::POLLOUT);
            roles.push(FdRole::Writer);
        }
        if let Some(r) = &out_reader {
            raw_fds.push(r.fd());
            flags.push(PollFlags::POLLIN);
            roles.push(FdRole::Out);
        }
        if let Some(r) = &err_reader {
            raw_fds.push(r.fd());
            flags.push(PollFlags::POLLIN);
            roles.push(FdRole::Err);
        }

        if roles.is_empty() {
            break;
        }

        let mut poll_fds: Vec<PollFd> = raw_fds
            .iter()
            .zip(flags.iter())
            .map(|(fd, flag)| {
                // SAFETY: each fd is owned by `writer`/`out_reader`/
                // `err_reader`, all of which outlive this poll call.
                PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(*fd) }, *flag)
            })
            .collect();

        let poll_timeout = PollTimeout::try_from(100u16).unwrap_or(PollTimeout::NONE);
        if nix::poll::poll(&mut poll_fds, poll_timeout).is_err() {
            continue;
        }

        for (pfd, role) in poll_fds.iter().zip(roles.iter()) {
            let events = pfd.revents().unwrap_or(PollFlags::empty());
            if events.is_empty() {
                continue;
            }
            match role {
                FdRole::Writer => {
                    if matches!(writer.step(), WriteStep::Done) {
                        writer_done = true;
                    }
                }
                FdRole::Out => {
                    let mut capture = capture_out.lock().unwrap();
                    if out_reader.as_mut().unwrap().step(&mut capture) {
                        out_reader = None;
                    }
                }
                FdRole::Err => {
                    let mut capture = capture_err.lock().unwrap();
                    if err_reader.as_mut().unwrap().step(&mut capture) {
                        err_reader = None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_command_joins_program_and_args() {
        let text = render_command(OsStr::new("/bin/echo"), &["hello", "world"]);
        assert_eq!(text, "/bin/echo hello world");
    }

    fn find_bin(name: &str) -> String {
        for dir in ["/usr/bin", "/bin"] {
            let candidate = format!("{dir}/{name}");
            if std::path::Path::new(&candidate).exists() {
                return candidate;
            }
        }
        name.to_string()
    }

    #[test]
    fn true_exits_zero() {
        let mut proc = OProc::spawn(find_bin("true"), &[] as &[&str], Options::default())
            .expect("spawn true");
        let reaped = proc.wait();
        assert_eq!(reaped.status, ExitStatus::Exited(0));
    }

    #[test]
    fn false_exits_nonzero() {
        let mut proc = OProc::spawn(find_bin("false"), &[] as &[&str], Options::default())
            .expect("spawn false");
        let reaped = proc.wait();
        assert_eq!(reaped.status, ExitStatus::Exited(1));
    }

    #[test]
    fn echo_captures_stdout() {
        let mut proc = OProc::spawn(find_bin("echo"), &["hi"], Options::default())
            .expect("spawn echo");
        let reaped = proc.wait();
        assert!(String::from_utf8_lossy(&reaped.stdout).contains("hi"));
    }

    #[test]
    fn timeout_emits_a_warn_event() {
        use std::io;
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::fmt::MakeWriter;

        #[derive(Clone)]
        struct SharedBufferWriter {
            buf: Arc<Mutex<Vec<u8>>>,
        }
        impl io::Write for SharedBufferWriter {
            fn write(&mut self, data: &[u8]) -> io::Result<usize> {
                self.buf.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        #[derive(Clone)]
        struct SharedMakeWriter {
            buf: Arc<Mutex<Vec<u8>>>,
        }
        impl<'a> MakeWriter<'a> for SharedMakeWriter {
            type Writer = SharedBufferWriter;
            fn make_writer(&'a self) -> Self::Writer {
                SharedBufferWriter {
                    buf: Arc::clone(&self.buf),
                }
            }
        }

        let log_buf = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .without_time()
            .with_writer(SharedMakeWriter {
                buf: Arc::clone(&log_buf),
            })
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let opts = Options {
                timeout: Some(Duration::from_millis(50)),
                ..Options::default()
            };
            let mut proc = OProc::spawn(find_bin("sleep"), &["5"], opts).expect("spawn sleep");
            let reaped = proc.wait();
            assert!(reaped.timed_out);
        });

        let logged = String::from_utf8(log_buf.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("command timed out"));
    }

    #[test]
    fn no_out_suppresses_stdout_capture() {
        let opts = Options {
            no_out: true,
            ..Options::default()
        };
        let mut proc =
            OProc::spawn(find_bin("echo"), &["hi"], opts).expect("spawn echo");
        let reaped = proc.wait();
        assert!(reaped.stdout.is_empty());
    }

    #[test]
    fn fd_sink_writes_directly_to_the_caller_s_descriptor() {
        let dir = tempfile::tempdir().expect("scratch dir");
        let path = dir.path().join("fd-sink-output.txt");
        let file = std::fs::File::create(&path).expect("create scratch file");
        let raw_fd = file.as_raw_fd();

        let opts = Options {
            stdout: Some(Sink::Fd(raw_fd)),
            ..Options::default()
        };
        let mut proc = OProc::spawn(find_bin("echo"), &["hi"], opts).expect("spawn echo");
        let reaped = proc.wait();
        drop(file);

        // A raw-fd sink bypasses capture entirely; the bytes land only in
        // the caller's own descriptor.
        assert!(reaped.stdout.is_empty());
        let written = std::fs::read(&path).expect("fd sink should have written the file");
        assert!(String::from_utf8_lossy(&written).contains("hi"));
    }

    #[test]
    fn fg_runs_synchronously_without_a_capture_buffer() {
        let opts = Options {
            fg: true,
            ..Options::default()
        };
        let mut proc = OProc::spawn(find_bin("true"), &[] as &[&str], opts).expect("spawn true");
        let reaped = proc.wait();
        assert_eq!(reaped.status, ExitStatus::Exited(0));
        assert!(reaped.stdout.is_empty());
    }
}
