use crossbeam::channel::{self, Receiver, Sender};
use std::io::{self, BufRead, Read};

enum Chunk {
    Data(Vec<u8>),
    Abort(String),
}

/// Create a connected writer/stream pair holding at most `depth` chunks in flight.
pub fn channel(depth: usize) -> (FlowWriter, FlowStream) {
    let (tx, rx) = channel::bounded(depth.max(1));
    (
        FlowWriter { tx },
        FlowStream {
            rx,
            buf: Vec::new(),
            pos: 0,
            eof: false,
            failure: None,
        },
    )
}

/// Reassembly side of a flow. Dropping it ends the stream.
pub struct FlowWriter {
    tx: Sender<Chunk>,
}

impl FlowWriter {
    /// Queue in-order bytes, blocking while the reader is behind.
    /// Returns `false` once the reader has gone away.
    pub fn send(&self, data: Vec<u8>) -> bool {
        self.tx.send(Chunk::Data(data)).is_ok()
    }

    /// Make every further read on the stream fail with `reason`.
    pub fn abort(&self, reason: String) {
        let _ = self.tx.send(Chunk::Abort(reason));
    }
}

/// Ordered bytes of one flow, as seen by its worker.
///
/// Reads block until more data arrives or the writer is dropped.
pub struct FlowStream {
    rx: Receiver<Chunk>,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
    failure: Option<String>,
}

impl FlowStream {
    /// Pull the next chunk into the buffer. Returns `false` at end of stream.
    fn pull(&mut self) -> io::Result<bool> {
        if let Some(reason) = &self.failure {
            return Err(io::Error::other(reason.clone()));
        }
        if self.eof {
            return Ok(false);
        }
        match self.rx.recv() {
            Ok(Chunk::Data(data)) => {
                if self.pos == self.buf.len() {
                    self.buf = data;
                    self.pos = 0;
                } else {
                    self.buf.drain(..self.pos);
                    self.pos = 0;
                    self.buf.extend_from_slice(&data);
                }
                Ok(true)
            }
            Ok(Chunk::Abort(reason)) => {
                self.failure = Some(reason.clone());
                Err(io::Error::other(reason))
            }
            Err(_) => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    /// Look at up to `n` upcoming bytes without consuming them.
    /// A shorter slice means the stream ends before `n` bytes.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() - self.pos < n {
            if !self.pull()? {
                break;
            }
        }
        let end = (self.pos + n).min(self.buf.len());
        Ok(&self.buf[self.pos..end])
    }
}

impl Read for FlowStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for FlowStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.pos == self.buf.len() {
            if !self.pull()? {
                break;
            }
        }
        Ok(&self.buf[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.buf.len());
    }
}
