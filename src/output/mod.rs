use colored::Colorize;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;

use crate::geo::Location;
use crate::protocol::FlowKey;
use crate::sanitize::{sanitize_payload, sanitize_text};

/// Something the operator should see.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Header {
        flow: String,
        header: Value,
    },
    Message {
        flow: String,
        #[serde(serialize_with = "lossy_text")]
        payload: Vec<u8>,
    },
    KeyDiscovered {
        peer: SocketAddr,
        key: String,
    },
    DeviceLocated {
        peer: SocketAddr,
        serial: String,
        location: Location,
    },
}

impl Event {
    pub fn header(flow: &FlowKey, header: Value) -> Self {
        Event::Header {
            flow: flow.to_string(),
            header,
        }
    }

    pub fn message(flow: &FlowKey, payload: &[u8]) -> Self {
        Event::Message {
            flow: flow.to_string(),
            payload: payload.to_vec(),
        }
    }
}

fn lossy_text<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

/// Sink for events raised on flow workers.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &Event);
}

/// Prints events to stdout, as colored text or one JSON object per line.
pub struct Formatter {
    json: bool,
}

impl Formatter {
    pub fn new(json: bool) -> Self {
        Formatter { json }
    }

    /// Final key listing: one key per line.
    pub fn print_keys(&self, keys: &[String]) {
        if self.json {
            println!("{}", json!({ "type": "keys", "keys": keys }));
        } else {
            for key in keys {
                println!("{}", sanitize_text(key));
            }
        }
    }

    fn print_text(&self, event: &Event) {
        match event {
            Event::Header { flow, header } => {
                println!("{} {} {}", "HEADER".cyan().bold(), flow.green(), header);
            }
            Event::Message { flow, payload } => {
                println!("{} {}", "MESSAGE".magenta().bold(), flow.green());
                println!("{}", sanitize_payload(payload));
            }
            Event::KeyDiscovered { peer, key } => {
                println!(
                    "{} {} for {}",
                    "discovered key:".red().bold(),
                    sanitize_text(key).yellow(),
                    peer
                );
            }
            Event::DeviceLocated {
                peer,
                serial,
                location,
            } => {
                println!(
                    "{} {} at {},{} ({}) via {}",
                    "Device".blue().bold(),
                    sanitize_text(serial).yellow(),
                    location.lat,
                    location.lng,
                    location.accuracy,
                    peer
                );
            }
        }
    }
}

impl Reporter for Formatter {
    fn report(&self, event: &Event) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "event not serializable"),
            }
        } else {
            self.print_text(event);
        }
    }
}
