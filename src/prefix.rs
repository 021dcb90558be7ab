//! Line-prefixing writer for multiplexed child output.
//!
//! Subprocess output arrives in arbitrary chunks; this adapter tags every
//! newline-terminated line with a constant prefix before forwarding it to
//! the downstream sink, so the operator can attribute interleaved output
//! from many children. Each completed line is pushed downstream as a single
//! `write_all`, which keeps lines from distinct writers from interleaving
//! within a line as long as the shared sink serialises individual calls
//! (as `io::Stdout` does).

use std::io::{self, Write};
use std::sync::Mutex;

/// Wraps a byte sink, prefixing every line written through it.
///
/// A trailing partial line (no `\n` yet) is buffered until a later write
/// completes it or [`flush`](Write::flush) is called. All flushed payload
/// bytes are also recorded in a transcript for post-run capture.
pub struct PrefixWriter<W> {
    prefix: Vec<u8>,
    inner: Mutex<Inner<W>>,
}

struct Inner<W> {
    sink: W,
    buf: Vec<u8>,
    transcript: Vec<u8>,
}

impl<W: Write> PrefixWriter<W> {
    pub fn new(sink: W, prefix: &str) -> Self {
        Self {
            prefix: prefix.as_bytes().to_vec(),
            inner: Mutex::new(Inner {
                sink,
                buf: Vec::new(),
                transcript: Vec::new(),
            }),
        }
    }

    /// Write a chunk of bytes, emitting a prefixed line for every `\n`
    /// encountered. Returns the full chunk length on success.
    pub fn write_chunk(&self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut rest = data;
        while let Some(idx) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(idx + 1);
            inner.emit(&self.prefix, line)?;
            rest = tail;
        }
        inner.buf.extend_from_slice(rest);
        Ok(data.len())
    }

    /// Flush a dangling partial line, if any, then flush the sink.
    pub fn flush_partial(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.buf.is_empty() {
            inner.emit(&self.prefix, &[])?;
        }
        inner.sink.flush()
    }

    /// Write straight to the sink, bypassing prefixing and the transcript.
    /// Used for operator-facing notices like the dry-run command echo.
    pub fn write_unprefixed(&self, data: &[u8]) -> io::Result<()> {
        self.inner.lock().unwrap().sink.write_all(data)
    }

    /// Every payload byte flushed so far, prefixes excluded.
    pub fn transcript(&self) -> Vec<u8> {
        self.inner.lock().unwrap().transcript.clone()
    }
}

impl<W: Write> Inner<W> {
    // Emits prefix + buffered partial + tail as one downstream write.
    fn emit(&mut self, prefix: &[u8], tail: &[u8]) -> io::Result<()> {
        let mut line = Vec::with_capacity(prefix.len() + self.buf.len() + tail.len());
        line.extend_from_slice(prefix);
        line.extend_from_slice(&self.buf);
        line.extend_from_slice(tail);
        self.sink.write_all(&line)?;
        self.transcript.extend_from_slice(&self.buf);
        self.transcript.extend_from_slice(tail);
        self.buf.clear();
        Ok(())
    }
}

impl<W: Write> Write for PrefixWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_chunk(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_partial()
    }
}
