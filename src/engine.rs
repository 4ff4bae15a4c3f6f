//! Drives a capture through reassembly and runs one framer thread per flow.

use anyhow::Result;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, debug_span, error, info, warn};

use crate::capture::PacketSource;
use crate::framer::{FlowFramer, FrameStats, MessageHandler};
use crate::protocol::http::HttpLimits;
use crate::protocol::{self, FlowKey, LinkType, TcpSegment};
use crate::reassembly::stream::FlowStream;
use crate::reassembly::{FlowConfig, FlowFactory, FlowTable};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub flow: FlowConfig,
    pub http: HttpLimits,
}

/// Totals for a finished run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub packets: usize,
    pub segments: usize,
    pub flows: usize,
    pub messages: usize,
    /// Workers that panicked or could not be started.
    pub failed_workers: usize,
}

type Worker = (FlowKey, JoinHandle<io::Result<FrameStats>>);

/// Owns the per-flow worker threads.
pub struct Supervisor<H: MessageHandler + 'static> {
    handler: Arc<H>,
    limits: HttpLimits,
    workers: Vec<Worker>,
    spawned: usize,
    messages: usize,
    failed: usize,
}

impl<H: MessageHandler + 'static> Supervisor<H> {
    pub fn new(handler: Arc<H>, limits: HttpLimits) -> Self {
        Supervisor {
            handler,
            limits,
            workers: Vec::new(),
            spawned: 0,
            messages: 0,
            failed: 0,
        }
    }

    fn settle(&mut self, key: FlowKey, outcome: thread::Result<io::Result<FrameStats>>) {
        match outcome {
            Ok(Ok(stats)) => self.messages += stats.messages,
            Ok(Err(e)) => warn!(flow = %key, error = %e, "flow worker stopped on read error"),
            Err(_) => {
                error!(flow = %key, "flow worker panicked");
                self.failed += 1;
            }
        }
    }

    /// Join workers that already finished so long captures do not pile up handles.
    fn reap(&mut self) {
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].1.is_finished() {
                let (key, handle) = self.workers.swap_remove(i);
                self.settle(key, handle.join());
            } else {
                i += 1;
            }
        }
    }

    /// Wait for every worker.
    pub fn join_all(&mut self) {
        for (key, handle) in std::mem::take(&mut self.workers) {
            self.settle(key, handle.join());
        }
    }
}

impl<H: MessageHandler + 'static> FlowFactory for Supervisor<H> {
    fn new_flow(&mut self, key: FlowKey, stream: FlowStream) {
        self.reap();

        let handler = Arc::clone(&self.handler);
        let limits = self.limits;
        let spawned = thread::Builder::new()
            .name(format!("flow-{}", self.spawned))
            .spawn(move || {
                let _span = debug_span!("flow", %key).entered();
                FlowFramer::new(key, stream, handler.as_ref(), limits).run()
            });
        self.spawned += 1;

        match spawned {
            Ok(handle) => self.workers.push((key, handle)),
            Err(e) => {
                // The stream is dropped with the closure, so the table detaches the flow.
                error!(flow = %key, error = %e, "could not start flow worker");
                self.failed += 1;
            }
        }
    }
}

pub struct Engine<H: MessageHandler + 'static> {
    table: FlowTable<Supervisor<H>>,
    packets: usize,
    segments: usize,
}

impl<H: MessageHandler + 'static> Engine<H> {
    pub fn new(handler: Arc<H>, config: &EngineConfig) -> Self {
        let supervisor = Supervisor::new(handler, config.http);
        Engine {
            table: FlowTable::new(supervisor, config.flow.clone()),
            packets: 0,
            segments: 0,
        }
    }

    /// Feed one captured frame. Non-TCP traffic is counted and dropped.
    pub fn process_frame(&mut self, data: &[u8], link_type: LinkType) {
        self.packets += 1;
        if let Some(segment) = protocol::parse_packet(data, link_type) {
            self.process_segment(&segment);
        }
    }

    pub fn process_segment(&mut self, segment: &TcpSegment) {
        self.segments += 1;
        self.table.process(segment);
    }

    /// Close every flow and wait for all workers.
    pub fn finish(self) -> RunSummary {
        let flows = self.table.flows_seen();
        let mut supervisor = self.table.into_factory();
        supervisor.join_all();

        let summary = RunSummary {
            packets: self.packets,
            segments: self.segments,
            flows,
            messages: supervisor.messages,
            failed_workers: supervisor.failed,
        };
        debug!(?summary, "run finished");
        summary
    }
}

/// Process a whole capture, blocking until every flow worker is done.
pub fn run<H: MessageHandler + 'static>(
    source: &mut PacketSource,
    handler: Arc<H>,
    config: &EngineConfig,
) -> Result<RunSummary> {
    let link_type = source.link_type();
    let mut engine = Engine::new(handler, config);

    let read = source.for_each_packet(|packet| {
        engine.process_frame(packet.data, link_type);
        true
    });
    // Workers are joined even when the file is cut short.
    let summary = engine.finish();
    read?;

    info!(
        packets = summary.packets,
        flows = summary.flows,
        messages = summary.messages,
        failed = summary.failed_workers,
        "capture processed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classifier, ClassifierOptions};
    use crate::extract::Extractor;
    use crate::inform::{seal, InformCodec, InformHeader};
    use crate::output::{Event, Reporter};
    use crate::protocol::http::HttpMessage;
    use crate::protocol::TcpFlags;
    use crate::registry::{KeyRegistry, LocatedDevices};
    use parking_lot::Mutex;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct Events(Mutex<Vec<Event>>);

    impl Reporter for Events {
        fn report(&self, event: &Event) {
            self.0.lock().push(event.clone());
        }
    }

    fn seg(src: &str, dst: &str, seq: u32, flags: TcpFlags, payload: &[u8]) -> TcpSegment {
        TcpSegment {
            src: src.parse::<SocketAddr>().unwrap(),
            dst: dst.parse::<SocketAddr>().unwrap(),
            seq,
            flags,
            payload: payload.to_vec(),
        }
    }

    fn syn() -> TcpFlags {
        TcpFlags {
            syn: true,
            ..Default::default()
        }
    }

    fn fin() -> TcpFlags {
        TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }

    fn ack() -> TcpFlags {
        TcpFlags {
            ack: true,
            ..Default::default()
        }
    }

    fn pipeline() -> (Arc<KeyRegistry>, Arc<Events>, Arc<Classifier<InformCodec>>) {
        let keys = Arc::new(KeyRegistry::new());
        let events = Arc::new(Events::default());
        let extractor = Extractor::new(keys.clone(), Arc::new(LocatedDevices::new()), None, events.clone());
        let classifier = Classifier::new(InformCodec, keys.clone(), extractor, events.clone(), ClassifierOptions::default());
        (keys, events, Arc::new(classifier))
    }

    fn post(body: &[u8]) -> Vec<u8> {
        let mut raw = format!(
            "POST /inform HTTP/1.1\r\nHost: unifi:8080\r\nContent-Type: application/x-binary\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    #[test]
    fn setparam_post_yields_key() {
        let (keys, events, classifier) = pipeline();
        let body = seal(
            &InformHeader::new([0; 6], 0, [0; 16]),
            br#"{"_type":"setparam","mgmt_cfg":"authkey=abc,other=1"}"#,
            None,
        )
        .unwrap();
        let request = post(&body);

        let mut engine = Engine::new(classifier, &EngineConfig::default());
        let (c, s) = ("10.0.0.5:40000", "10.0.0.1:8080");
        engine.process_segment(&seg(c, s, 100, syn(), b""));
        // Split mid-header to exercise reassembly.
        engine.process_segment(&seg(c, s, 101, ack(), &request[..20]));
        engine.process_segment(&seg(c, s, 121, ack(), &request[20..]));
        engine.process_segment(&seg(c, s, 101 + request.len() as u32, fin(), b""));
        let summary = engine.finish();

        assert_eq!(summary.flows, 1);
        assert_eq!(summary.messages, 1);
        assert_eq!(summary.failed_workers, 0);
        assert_eq!(keys.keys(), vec!["abc".to_string()]);
        let events = events.0.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::KeyDiscovered { key, peer } if key == "abc" && peer.to_string() == s));
    }

    #[test]
    fn not_found_response_is_silent() {
        let (keys, events, classifier) = pipeline();
        let mut engine = Engine::new(classifier, &EngineConfig::default());
        let resp = b"HTTP/1.1 404 Not Found\r\nContent-Type: application/x-binary\r\nContent-Length: 0\r\n\r\n";
        engine.process_segment(&seg("10.0.0.1:8080", "10.0.0.5:40000", 7, ack(), resp));
        let summary = engine.finish();
        assert_eq!(summary.messages, 1);
        assert!(keys.is_empty());
        assert!(events.0.lock().is_empty());
    }

    struct PanicOn(u16);

    impl MessageHandler for PanicOn {
        fn handle(&self, flow: &FlowKey, _message: HttpMessage) {
            if flow.src.port() == self.0 {
                panic!("boom");
            }
        }
    }

    #[test]
    fn panicking_worker_does_not_affect_siblings() {
        let mut engine = Engine::new(Arc::new(PanicOn(1111)), &EngineConfig::default());
        let req = post(b"x");
        engine.process_segment(&seg("10.0.0.5:1111", "10.0.0.1:8080", 1, ack(), &req));
        engine.process_segment(&seg("10.0.0.6:2222", "10.0.0.1:8080", 1, ack(), &req));
        engine.process_segment(&seg("10.0.0.7:3333", "10.0.0.1:8080", 1, ack(), &req));
        let summary = engine.finish();
        assert_eq!(summary.flows, 3);
        assert_eq!(summary.failed_workers, 1);
        assert_eq!(summary.messages, 2);
    }

    struct Count(Mutex<usize>);

    impl MessageHandler for Count {
        fn handle(&self, _flow: &FlowKey, _message: HttpMessage) {
            *self.0.lock() += 1;
        }
    }

    #[test]
    fn many_flows_all_joined() {
        let counter = Arc::new(Count(Mutex::new(0)));
        let mut engine = Engine::new(counter.clone(), &EngineConfig::default());
        let req = post(b"hello");
        for port in 0..200u16 {
            let src = format!("10.0.1.1:{}", 20000 + port);
            engine.process_segment(&seg(&src, "10.0.0.1:8080", 5, ack(), &req));
            engine.process_segment(&seg(&src, "10.0.0.1:8080", 5 + req.len() as u32, ack(), &req));
        }
        let summary = engine.finish();
        assert_eq!(summary.flows, 200);
        assert_eq!(summary.messages, 400);
        assert_eq!(*counter.0.lock(), 400);
    }

    #[test]
    fn non_tcp_frames_counted_only() {
        let counter = Arc::new(Count(Mutex::new(0)));
        let mut engine = Engine::new(counter, &EngineConfig::default());
        engine.process_frame(&[0u8; 10], LinkType::Ethernet);
        let summary = engine.finish();
        assert_eq!(summary.packets, 1);
        assert_eq!(summary.segments, 0);
        assert_eq!(summary.flows, 0);
    }
}
