//! Splits a flow's byte stream into HTTP messages.
//!
//! A connection can carry several envelope exchanges back to back, so the
//! framer loops until the stream ends instead of reading it once. Bytes that
//! do not start a message are skipped until a start marker lines up again.

use std::io::{self, BufRead};
use tracing::debug;

use crate::error::HttpError;
use crate::protocol::http::{self, HttpLimits, HttpMessage};
use crate::protocol::FlowKey;
use crate::reassembly::stream::FlowStream;

const REQUEST_MARKER: &[u8; 4] = b"POST";
const RESPONSE_MARKER: &[u8; 4] = b"HTTP";

/// Consumer of framed messages.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, flow: &FlowKey, message: HttpMessage);
}

/// Counters for one finished flow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub messages: usize,
    pub parse_errors: usize,
    pub skipped_bytes: usize,
}

pub struct FlowFramer<'a, H: MessageHandler + ?Sized> {
    flow: FlowKey,
    stream: FlowStream,
    handler: &'a H,
    limits: HttpLimits,
    stats: FrameStats,
}

impl<'a, H: MessageHandler + ?Sized> FlowFramer<'a, H> {
    pub fn new(flow: FlowKey, stream: FlowStream, handler: &'a H, limits: HttpLimits) -> Self {
        FlowFramer {
            flow,
            stream,
            handler,
            limits,
            stats: FrameStats::default(),
        }
    }

    /// Frame until end of stream. An `Err` is a stream failure, never a
    /// parse failure.
    pub fn run(mut self) -> io::Result<FrameStats> {
        loop {
            let window = self.stream.peek(4)?;
            if window.len() < 4 {
                break;
            }

            let result = if window == REQUEST_MARKER {
                http::read_request(&mut self.stream, &self.limits)
            } else if window == RESPONSE_MARKER {
                http::read_response(&mut self.stream, &self.limits)
            } else {
                let skip = resync_distance(window);
                self.stream.consume(skip);
                self.stats.skipped_bytes += skip;
                continue;
            };

            match result {
                Ok(message) => {
                    self.stats.messages += 1;
                    self.handler.handle(&self.flow, message);
                }
                Err(HttpError::Io(e)) => return Err(e),
                Err(e) => {
                    self.stats.parse_errors += 1;
                    debug!(flow = %self.flow, error = %e, "skipping unparseable message");
                }
            }
        }

        debug!(
            flow = %self.flow,
            messages = self.stats.messages,
            parse_errors = self.stats.parse_errors,
            skipped = self.stats.skipped_bytes,
            "flow finished"
        );
        Ok(self.stats)
    }
}

/// Bytes to drop from a 4-byte window that starts no message: all of them,
/// unless a marker could begin inside the window.
fn resync_distance(window: &[u8]) -> usize {
    (1..window.len())
        .find(|&i| {
            let tail = &window[i..];
            REQUEST_MARKER.starts_with(tail) || RESPONSE_MARKER.starts_with(tail)
        })
        .unwrap_or(window.len())
}
