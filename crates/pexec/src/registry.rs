//! Process-wide child registry: every non-persistent `OProc` is tracked
//! here so a host exit can reap its stragglers instead of leaking them.

use std::sync::{Mutex, OnceLock};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

fn table() -> &'static Mutex<Vec<i32>> {
    static TABLE: OnceLock<Mutex<Vec<i32>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        install_atexit_hook();
        Mutex::new(Vec::new())
    })
}

fn install_atexit_hook() {
    extern "C" fn cleanup() {
        kill_all_registered();
    }
    // SAFETY: `libc::atexit` registers a plain C function pointer with no
    // captured state; `cleanup` only calls async-signal-unsafe-free code
    // that is safe to run once at process exit.
    unsafe {
        libc::atexit(cleanup);
    }
}

/// Track a freshly-spawned child so it gets a `SIGKILL` if the host exits
/// before reaping it.
pub fn register(pid: Pid) {
    table().lock().unwrap().push(pid.as_raw());
}

/// Stop tracking a child, called once it has been reaped (or when the
/// caller opted out via `persist`).
pub fn deregister(pid: Pid) {
    let mut guard = table().lock().unwrap();
    if let Some(pos) = guard.iter().position(|&p| p == pid.as_raw()) {
        guard.swap_remove(pos);
    }
}

/// `true` if `pid` is currently tracked (used by tests and diagnostics).
pub fn is_registered(pid: Pid) -> bool {
    table().lock().unwrap().contains(&pid.as_raw())
}

fn kill_all_registered() {
    let Ok(guard) = table().lock() else {
        return;
    };
    for &raw_pid in guard.iter() {
        let _ = signal::kill(Pid::from_raw(raw_pid), Signal::SIGKILL);
    }
}
