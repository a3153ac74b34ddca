//! `StreamBufferer`: a pure byte-buffer reassembler.
//!
//! Carries a small residual buffer and nothing else. Never touches a file
//! descriptor; [`StreamReader`](crate::reader::StreamReader) is the only
//! caller.

/// Per-stream buffering granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bufsize {
    /// `bufsize == 0`: every chunk is emitted immediately, unsplit.
    Unbuffered,
    /// `bufsize == 1`: chunks are reassembled into complete lines.
    Line,
    /// `bufsize > 1`: chunks are reassembled into fixed-size slices.
    Chunk(usize),
}

impl Bufsize {
    /// Construct from the raw integer the public options table uses:
    /// 0=unbuffered, 1=line-buffered, n>1=n-byte chunks.
    pub fn from_raw(n: usize) -> Self {
        match n {
            0 => Bufsize::Unbuffered,
            1 => Bufsize::Line,
            n => Bufsize::Chunk(n),
        }
    }

    /// The read-syscall size a [`StreamReader`](crate::reader::StreamReader)
    /// should request per step. Unbuffered reads one byte at a time;
    /// buffered modes read in larger gulps and let the bufferer cut them up.
    pub fn read_chunk_size(self) -> usize {
        match self {
            Bufsize::Unbuffered => 1,
            Bufsize::Line => 1024,
            Bufsize::Chunk(n) => n,
        }
    }
}

/// Reassembles a byte stream according to a [`Bufsize`] mode.
///
/// Contract: for any sequence of inputs, the concatenation of all emitted
/// outputs plus the final [`flush`](StreamBufferer::flush) equals the
/// concatenation of all inputs. Never mutates its input slices.
#[derive(Debug, Default)]
pub struct StreamBufferer {
    mode: BuffererMode,
    residual: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuffererMode {
    Unbuffered,
    Line,
    Chunk(usize),
}

impl Default for BuffererMode {
    fn default() -> Self {
        BuffererMode::Unbuffered
    }
}

impl StreamBufferer {
    pub fn new(bufsize: Bufsize) -> Self {
        let mode = match bufsize {
            Bufsize::Unbuffered => BuffererMode::Unbuffered,
            Bufsize::Line => BuffererMode::Line,
            Bufsize::Chunk(n) => BuffererMode::Chunk(n.max(1)),
        };
        Self {
            mode,
            residual: Vec::new(),
        }
    }

    /// Feed a freshly-read chunk; returns zero or more pieces ready to hand
    /// to a sink, in order.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        match self.mode {
            BuffererMode::Unbuffered => vec![chunk.to_vec()],
            BuffererMode::Line => self.process_line(chunk),
            BuffererMode::Chunk(n) => self.process_chunk(chunk, n),
        }
    }

    fn process_line(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.residual.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            let Some(pos) = self.residual.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.residual.drain(..=pos).collect();
            out.push(line);
        }
        out
    }

    fn process_chunk(&mut self, chunk: &[u8], n: usize) -> Vec<Vec<u8>> {
        self.residual.extend_from_slice(chunk);
        let mut out = Vec::new();
        while self.residual.len() >= n {
            out.push(self.residual.drain(..n).collect());
        }
        out
    }

    /// Drain and return whatever partial data remains, clearing the
    /// residual. Called on EOF so a trailing incomplete line/chunk is not
    /// lost.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.residual.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.residual))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(pieces: &[Vec<u8>]) -> Vec<u8> {
        pieces.iter().flat_map(|p| p.iter().copied()).collect()
    }

    #[test]
    fn unbuffered_emits_every_chunk_verbatim() {
        let mut b = StreamBufferer::new(Bufsize::Unbuffered);
        assert_eq!(b.process(b"a"), vec![b"a".to_vec()]);
        assert_eq!(b.process(b"bc"), vec![b"bc".to_vec()]);
        assert_eq!(b.flush(), None);
    }

    #[test]
    fn line_buffered_splits_on_newline_and_retains_newline() {
        let mut b = StreamBufferer::new(Bufsize::Line);
        let out = b.process(b"foo\nbar\nbaz");
        assert_eq!(out, vec![b"foo\n".to_vec(), b"bar\n".to_vec()]);
        assert_eq!(b.flush(), Some(b"baz".to_vec()));
    }

    #[test]
    fn line_buffered_handles_split_newline_across_chunks() {
        let mut b = StreamBufferer::new(Bufsize::Line);
        assert_eq!(b.process(b"foo"), Vec::<Vec<u8>>::new());
        assert_eq!(b.process(b"\nbar"), vec![b"foo\n".to_vec()]);
        assert_eq!(b.flush(), Some(b"bar".to_vec()));
    }

    #[test]
    fn chunk_buffered_emits_fixed_size_slices() {
        let mut b = StreamBufferer::new(Bufsize::Chunk(4));
        let out = b.process(b"0123456789");
        assert_eq!(out, vec![b"0123".to_vec(), b"4567".to_vec()]);
        assert_eq!(b.flush(), Some(b"89".to_vec()));
    }

    #[test]
    fn associativity_holds_for_arbitrary_chunking() {
        let input = b"the quick brown fox jumps over the lazy dog\n\nline two\n".to_vec();
        for bufsize in [Bufsize::Unbuffered, Bufsize::Line, Bufsize::Chunk(7)] {
            // Whole input in one shot.
            let mut whole = StreamBufferer::new(bufsize);
            let mut whole_out = whole.process(&input);
            if let Some(tail) = whole.flush() {
                whole_out.push(tail);
            }

            // Byte-at-a-time.
            let mut piecemeal = StreamBufferer::new(bufsize);
            let mut piecemeal_out = Vec::new();
            for byte in &input {
                piecemeal_out.extend(piecemeal.process(std::slice::from_ref(byte)));
            }
            if let Some(tail) = piecemeal.flush() {
                piecemeal_out.push(tail);
            }

            assert_eq!(concat(&whole_out), input);
            assert_eq!(concat(&piecemeal_out), input);
        }
    }

    #[test]
    fn from_raw_matches_bufsize_convention() {
        assert_eq!(Bufsize::from_raw(0), Bufsize::Unbuffered);
        assert_eq!(Bufsize::from_raw(1), Bufsize::Line);
        assert_eq!(Bufsize::from_raw(64), Bufsize::Chunk(64));
    }
}
