//! POSIX process execution engine: fork/exec under a controlled pty
//! topology, typed stream sources/sinks, pipelines, timeouts, and
//! signal-aware lifecycles.
//!
//! The engine drives one child's three standard streams from a single io
//! thread per process (`oproc`); everything above that (`command`,
//! `pipeline`) is a thin, typed facade over it.

pub mod buffering;
pub mod command;
pub mod oproc;
pub mod options;
pub mod pipeline;
pub mod pty;
pub mod queue;
pub mod reader;
pub mod registry;
pub mod scope;
pub mod writer;

#[cfg(feature = "async")]
pub mod asyncio;

pub use buffering::{Bufsize, StreamBufferer};
pub use command::{Iter, IterChunk, IterNoblock, RunningCommand};
pub use oproc::{OProc, Reaped};
pub use options::{DecodeErrors, DoneCallback, IterMode, Options, Piped, Tee};
pub use pipeline::{Stage, run as run_pipeline};
pub use queue::{PipeReceiver, PipeSender, channel};
pub use reader::{ChunkSink, ChunkStdinProcSink, ChunkStdinSink, Sink, StdinQueueHandle};
pub use scope::{PrefixScope, push as push_prefix};
pub use writer::StdinSource;

pub use pexec_core::{CapturedOutput, ExitStatus, Fault, OkCodes, Result, signal_name};
