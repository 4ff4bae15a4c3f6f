pub mod stream;

use std::collections::HashMap;
use tracing::debug;

use crate::protocol::{FlowKey, TcpSegment};
use stream::{FlowStream, FlowWriter};

/// Receives the stream of every newly observed flow.
pub trait FlowFactory {
    fn new_flow(&mut self, key: FlowKey, stream: FlowStream);
}

/// Limits for flow tracking.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// New flows beyond this many open ones are ignored.
    pub max_flows: usize,
    /// Out-of-order bytes held per flow before the gap is skipped.
    pub max_buffered_bytes: usize,
    /// Bytes delivered per flow before its stream is failed.
    pub max_flow_bytes: usize,
    /// Chunks queued per flow before the capture reader blocks.
    pub channel_depth: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            max_flows: 10_000,
            max_buffered_bytes: 1_048_576,   // 1 MB out of order
            max_flow_bytes: 256 * 1_048_576, // 256 MB per flow
            channel_depth: 256,
        }
    }
}

/// Tracks TCP flows and feeds their in-order bytes to per-flow streams.
pub struct FlowTable<F: FlowFactory> {
    flows: HashMap<FlowKey, FlowState>,
    factory: F,
    config: FlowConfig,
    flows_seen: usize,
}

struct FlowState {
    writer: FlowWriter,
    next_seq: Option<u32>,
    pending: Vec<(u32, Vec<u8>)>,
    pending_bytes: usize,
    delivered: usize,
    /// Reader is gone or the flow was failed; drop further data.
    detached: bool,
}

/// Signed distance from `b` to `a` in sequence space.
fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

impl FlowState {
    fn new(writer: FlowWriter) -> Self {
        FlowState {
            writer,
            next_seq: None,
            pending: Vec::new(),
            pending_bytes: 0,
            delivered: 0,
            detached: false,
        }
    }

    fn accept(&mut self, key: &FlowKey, seq: u32, data: &[u8], config: &FlowConfig) {
        let next = *self.next_seq.get_or_insert(seq);
        let diff = seq_diff(seq, next);

        if diff > 0 {
            self.pending.push((seq, data.to_vec()));
            self.pending_bytes += data.len();
            if self.pending_bytes > config.max_buffered_bytes {
                debug!(flow = %key, buffered = self.pending_bytes, "skipping unfilled gap");
                self.skip_gap();
            }
        } else {
            let skip = diff.unsigned_abs() as usize;
            if skip < data.len() {
                self.write(key, &data[skip..], config);
            }
        }
        self.drain(key, config);
    }

    /// Deliver buffered segments that are now contiguous.
    fn drain(&mut self, key: &FlowKey, config: &FlowConfig) {
        loop {
            let Some(next) = self.next_seq else { return };
            let Some(idx) = self
                .pending
                .iter()
                .position(|(seq, _)| seq_diff(*seq, next) <= 0)
            else {
                return;
            };
            let (seq, data) = self.pending.swap_remove(idx);
            self.pending_bytes -= data.len();
            let skip = seq_diff(next, seq) as usize;
            if skip < data.len() {
                self.write(key, &data[skip..], config);
            }
        }
    }

    /// Jump the expected sequence number to the closest buffered segment.
    fn skip_gap(&mut self) {
        let Some(next) = self.next_seq else { return };
        if let Some(closest) = self
            .pending
            .iter()
            .map(|(seq, _)| *seq)
            .min_by_key(|seq| seq_diff(*seq, next))
        {
            self.next_seq = Some(closest);
        }
    }

    fn write(&mut self, key: &FlowKey, data: &[u8], config: &FlowConfig) {
        self.next_seq = self.next_seq.map(|n| n.wrapping_add(data.len() as u32));
        if self.detached {
            return;
        }
        if self.delivered + data.len() > config.max_flow_bytes {
            debug!(flow = %key, "flow exceeded byte limit");
            self.writer
                .abort(format!("flow exceeded {} bytes", config.max_flow_bytes));
            self.detached = true;
            return;
        }
        self.delivered += data.len();
        if !self.writer.send(data.to_vec()) {
            self.detached = true;
        }
    }

    /// Deliver whatever is buffered, skipping gaps.
    fn flush(&mut self, key: &FlowKey, config: &FlowConfig) {
        while !self.pending.is_empty() {
            self.skip_gap();
            self.drain(key, config);
        }
    }
}

impl<F: FlowFactory> FlowTable<F> {
    pub fn new(factory: F, config: FlowConfig) -> Self {
        FlowTable {
            flows: HashMap::new(),
            factory,
            config,
            flows_seen: 0,
        }
    }

    /// Number of flows created so far.
    pub fn flows_seen(&self) -> usize {
        self.flows_seen
    }

    pub fn open_flows(&self) -> usize {
        self.flows.len()
    }

    /// Close every flow and hand back the factory.
    pub fn into_factory(mut self) -> F {
        self.close_all();
        self.factory
    }

    /// Feed one captured segment.
    pub fn process(&mut self, segment: &TcpSegment) {
        let key = segment.flow_key();
        let flags = segment.flags;

        // RST tears down both directions.
        if flags.rst {
            self.close(&key);
            self.close(&key.reverse());
            return;
        }

        if !self.flows.contains_key(&key) {
            // Pure ACKs and stray FINs do not open a flow.
            if !flags.syn && segment.payload.is_empty() {
                return;
            }
            if self.flows.len() >= self.config.max_flows {
                debug!(flow = %key, "flow table full, ignoring new flow");
                return;
            }
            let (writer, stream) = stream::channel(self.config.channel_depth);
            self.flows.insert(key, FlowState::new(writer));
            self.flows_seen += 1;
            self.factory.new_flow(key, stream);
        }

        let config = &self.config;
        let Some(state) = self.flows.get_mut(&key) else {
            return;
        };

        if flags.syn && state.next_seq.is_none() {
            state.next_seq = Some(segment.seq.wrapping_add(1));
        }
        if !segment.payload.is_empty() {
            let seq = if flags.syn {
                segment.seq.wrapping_add(1)
            } else {
                segment.seq
            };
            state.accept(&key, seq, &segment.payload, config);
        }

        if flags.fin {
            self.close(&key);
        }
    }

    /// Close one flow, delivering what is buffered.
    pub fn close(&mut self, key: &FlowKey) {
        if let Some(mut state) = self.flows.remove(key) {
            state.flush(key, &self.config);
        }
    }

    /// End of input: flush and close every open flow.
    pub fn close_all(&mut self) {
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        for key in keys {
            self.close(&key);
        }
    }
}
