//! Optional `tokio`-based adapter over [`RunningCommand`]'s pipe-queue.
//!
//! The blocking io thread inside `OProc` remains the single owner of
//! `waitpid`; this adapter only polls the same pipe-queue from a blocking
//! task, it never reaps the child itself.

use pexec_core::Fault;

use crate::command::RunningCommand;
use crate::queue::PipeReceiver;

/// Await the final reaped outcome of `cmd` without blocking the calling
/// async task's executor thread.
pub async fn wait(mut cmd: RunningCommand) -> Result<RunningCommand, Fault> {
    tokio::task::spawn_blocking(move || match cmd.wait(None) {
        Ok(_) => Ok(cmd),
        Err(fault) => Err(fault),
    })
    .await
    .expect("pexec wait task panicked")
}

/// Drain a pipe-queue as an async stream of chunks, terminating on the
/// `None` sentinel. Each `get()` call runs on a blocking task since the
/// queue itself uses `std::sync::Condvar`, not an async primitive.
pub fn chunk_stream(
    rx: PipeReceiver<Vec<u8>>,
) -> impl futures_util::Stream<Item = Vec<u8>> {
    futures_util::stream::unfold(rx, |rx| async move {
        let next_rx = rx.clone();
        let chunk = tokio::task::spawn_blocking(move || next_rx.get())
            .await
            .expect("pexec chunk_stream task panicked");
        chunk.map(|chunk| (chunk, rx))
    })
}
