//! `StreamWriter`: adapts heterogeneous stdin sources to a single write
//! descriptor.

use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::pty::veof_byte;
use crate::queue::PipeReceiver;

const STRING_CHUNK_SIZE: usize = 1024;

/// The classified stdin source: queue-like, callable, file-like,
/// byte-or-text string, or general iterable.
pub enum StdinSource {
    Bytes(Vec<u8>),
    Text(String),
    Queue(PipeReceiver<Vec<u8>>),
    Callable(Box<dyn FnMut() -> Option<Vec<u8>> + Send>),
    Reader(Box<dyn Read + Send>),
    Iter(Box<dyn Iterator<Item = Vec<u8>> + Send>),
}

impl std::fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            StdinSource::Bytes(_) => "Bytes",
            StdinSource::Text(_) => "Text",
            StdinSource::Queue(_) => "Queue",
            StdinSource::Callable(_) => "Callable",
            StdinSource::Reader(_) => "Reader",
            StdinSource::Iter(_) => "Iter",
        };
        write!(f, "StdinSource::{kind}")
    }
}

/// Result of one `StreamWriter::step` tick. On "no data available yet"
/// (queue empty) the writer yields without advancing.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteStep {
    /// A chunk was written.
    Wrote,
    /// Nothing was ready this tick; the writer remains live.
    NoData,
    /// EOF was signaled to the child and the writer is finished.
    Done,
}

enum Classified {
    Queue(PipeReceiver<Vec<u8>>),
    Callable(Box<dyn FnMut() -> Option<Vec<u8>> + Send>),
    Reader(Box<dyn Read + Send>),
    Iter(Box<dyn Iterator<Item = Vec<u8>> + Send>),
    Slices { data: Vec<u8>, offset: usize },
}

/// Drives one stdin descriptor from a classified [`StdinSource`].
pub struct StreamWriter {
    fd: OwnedFd,
    tty: bool,
    source: Classified,
    done: bool,
    /// When set, a write that would raise `EPIPE` is treated as a clean
    /// completion instead of an error.
    ignore_epipe: bool,
}

impl StreamWriter {
    pub fn new(fd: OwnedFd, tty: bool, source: StdinSource, ignore_epipe: bool) -> Self {
        let source = match source {
            StdinSource::Bytes(data) => Classified::Slices { data, offset: 0 },
            StdinSource::Text(text) => Classified::Slices {
                data: text.into_bytes(),
                offset: 0,
            },
            StdinSource::Queue(q) => Classified::Queue(q),
            StdinSource::Callable(f) => Classified::Callable(f),
            StdinSource::Reader(r) => Classified::Reader(r),
            StdinSource::Iter(it) => Classified::Iter(it),
        };
        Self {
            fd,
            tty,
            source,
            done: false,
            ignore_epipe,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Pull the next chunk from the classified source. `Ok(Some(chunk))` is
    /// a chunk to write; `Ok(None)` is EOF; `Err(())` means "no data yet,
    /// don't advance" (queue empty).
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ()> {
        match &mut self.source {
            Classified::Slices { data, offset } => {
                if *offset >= data.len() {
                    return Ok(None);
                }
                let end = (*offset + STRING_CHUNK_SIZE).min(data.len());
                let chunk = data[*offset..end].to_vec();
                *offset = end;
                Ok(Some(chunk))
            }
            Classified::Queue(q) => match q.try_get() {
                Ok(Some(chunk)) => Ok(Some(chunk)),
                Ok(None) => Ok(None),
                Err(_) => Err(()),
            },
            Classified::Callable(f) => Ok(f()),
            Classified::Reader(r) => {
                let mut buf = vec![0u8; STRING_CHUNK_SIZE];
                match r.read(&mut buf) {
                    Ok(0) => Ok(None),
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(Some(buf))
                    }
                    Err(_) => Ok(None),
                }
            }
            Classified::Iter(it) => Ok(it.next()),
        }
    }

    /// One scheduler tick: serves at most one write step per call.
    pub fn step(&mut self) -> WriteStep {
        if self.done {
            return WriteStep::Done;
        }
        match self.next_chunk() {
            Err(()) => WriteStep::NoData,
            Ok(None) => {
                self.signal_eof();
                self.done = true;
                WriteStep::Done
            }
            Ok(Some(chunk)) => {
                self.write_chunk(&chunk);
                WriteStep::Wrote
            }
        }
    }

    fn write_chunk(&mut self, chunk: &[u8]) {
        use nix::unistd::write;
        // SAFETY-free: `write` takes a borrowed fd and a byte slice; EPIPE
        // and other errors are handled below, not propagated as panics.
        match write(&self.fd, chunk) {
            Ok(_) => {}
            Err(nix::Error::EPIPE) if self.ignore_epipe => {
                self.done = true;
            }
            Err(nix::Error::EPIPE) => {
                // Outside a piped chain too: surface as a clean writer
                // completion. The child's own exit code, not the write,
                // carries the failure signal.
                self.done = true;
            }
            Err(_) => {
                self.done = true;
            }
        }
    }

    fn signal_eof(&mut self) {
        if self.tty {
            let veof = veof_byte(self.fd.as_raw_fd());
            let _ = nix::unistd::write(&self.fd, &[veof]);
        }
        // Closing happens when `self.fd` (an `OwnedFd`) is dropped by the
        // caller once `is_done()` is observed; see `oproc::io_loop`.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::channel;
    use nix::unistd::pipe;

    fn pipe_writer(source: StdinSource) -> (StreamWriter, OwnedFd) {
        let (read_end, write_end) = pipe().expect("pipe");
        (StreamWriter::new(write_end, false, source, false), read_end)
    }

    /// Close the writer (dropping its fd) then read the pipe to EOF.
    fn finish_and_drain(writer: StreamWriter, read_end: OwnedFd) -> Vec<u8> {
        drop(writer);
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match nix::unistd::read(read_end.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn bytes_source_slices_and_signals_eof() {
        let (mut writer, _read_end) = pipe_writer(StdinSource::Bytes(b"hello".to_vec()));
        assert_eq!(writer.step(), WriteStep::Wrote);
        assert_eq!(writer.step(), WriteStep::Done);
        assert!(writer.is_done());
    }

    #[test]
    fn queue_source_reports_no_data_until_pushed() {
        let (tx, rx) = channel::<Vec<u8>>(4);
        let (mut writer, _read_end) = pipe_writer(StdinSource::Queue(rx));
        assert_eq!(writer.step(), WriteStep::NoData);
        tx.put(b"chunk".to_vec());
        assert_eq!(writer.step(), WriteStep::Wrote);
        tx.close();
        assert_eq!(writer.step(), WriteStep::Done);
    }

    #[test]
    fn callable_source_drains_until_none() {
        let mut values = vec![b"a".to_vec(), b"b".to_vec()];
        let (mut writer, _read_end) = pipe_writer(StdinSource::Callable(Box::new(move || {
            if values.is_empty() { None } else { Some(values.remove(0)) }
        })));
        assert_eq!(writer.step(), WriteStep::Wrote);
        assert_eq!(writer.step(), WriteStep::Wrote);
        assert_eq!(writer.step(), WriteStep::Done);
    }

    #[test]
    fn large_text_is_split_into_1kib_pieces() {
        let text = "x".repeat(2500);
        let (mut writer, read_end) = pipe_writer(StdinSource::Text(text.clone()));
        let mut steps = 0;
        loop {
            match writer.step() {
                WriteStep::Wrote => steps += 1,
                WriteStep::Done => break,
                WriteStep::NoData => panic!("text source should never report NoData"),
            }
        }
        assert_eq!(steps, 3); // 1024 + 1024 + 452
        assert_eq!(finish_and_drain(writer, read_end), text.into_bytes());
    }
}
