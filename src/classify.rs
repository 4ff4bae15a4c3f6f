//! Decide which HTTP messages carry an envelope, then find a key that opens it.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::DecryptExhausted;
use crate::extract::Extractor;
use crate::framer::MessageHandler;
use crate::inform::{EnvelopeCodec, INFORM_CONTENT_TYPE};
use crate::output::{Event, Reporter};
use crate::protocol::http::{HttpKind, HttpMessage};
use crate::protocol::FlowKey;
use crate::registry::KeyRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Body carries an envelope.
    Accept,
    /// Expected traffic that carries nothing for us.
    Ignore,
    /// Response we do not know how to treat.
    Unhandled,
}

fn is_inform(message: &HttpMessage) -> bool {
    message
        .content_type()
        .is_some_and(|ct| ct.eq_ignore_ascii_case(INFORM_CONTENT_TYPE))
}

pub fn classify(message: &HttpMessage) -> Disposition {
    match &message.kind {
        HttpKind::Request { method, .. } => {
            if method == "POST" && is_inform(message) {
                Disposition::Accept
            } else {
                Disposition::Ignore
            }
        }
        HttpKind::Response { status, .. } => match *status {
            100 | 404 => Disposition::Ignore,
            200 if is_inform(message) => Disposition::Accept,
            _ => Disposition::Unhandled,
        },
    }
}

/// Plaintext plus the key that produced it (`None` for the unencrypted path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub key: Option<String>,
}

/// Try the no-key path, then every registry key in insertion order.
///
/// The registry is snapshotted once; keys added while the trial runs are
/// not tried, and a failed message is never revisited.
pub fn decrypt_trial<C: EnvelopeCodec + ?Sized>(
    codec: &C,
    header: &C::Header,
    ciphertext: &[u8],
    keys: &KeyRegistry,
) -> Result<Decrypted, DecryptExhausted> {
    let mut attempts = 1;
    let mut last = match codec.decode_payload(header, ciphertext, None) {
        Ok(plaintext) => return Ok(Decrypted { plaintext, key: None }),
        Err(e) => e,
    };

    for key in keys.keys() {
        attempts += 1;
        match codec.decode_payload(header, ciphertext, Some(&key)) {
            Ok(plaintext) => {
                return Ok(Decrypted {
                    plaintext,
                    key: Some(key),
                })
            }
            Err(e) => last = e,
        }
    }

    Err(DecryptExhausted { attempts, last })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClassifierOptions {
    /// Report every decoded envelope header.
    pub show_header: bool,
    /// Report every decrypted payload.
    pub show_message: bool,
}

/// Per-message pipeline run on flow workers: classify, decode, decrypt, extract.
pub struct Classifier<C: EnvelopeCodec> {
    codec: C,
    keys: Arc<KeyRegistry>,
    extractor: Extractor,
    reporter: Arc<dyn Reporter>,
    options: ClassifierOptions,
}

impl<C: EnvelopeCodec> Classifier<C> {
    pub fn new(
        codec: C,
        keys: Arc<KeyRegistry>,
        extractor: Extractor,
        reporter: Arc<dyn Reporter>,
        options: ClassifierOptions,
    ) -> Self {
        Classifier {
            codec,
            keys,
            extractor,
            reporter,
            options,
        }
    }

    fn envelope(&self, flow: &FlowKey, body: &[u8]) {
        let mut reader = body;
        let header = match self.codec.decode_header(&mut reader) {
            Ok(h) => h,
            Err(e) => {
                warn!(%flow, error = %e, "could not decode envelope header");
                return;
            }
        };
        let ciphertext = reader;

        if self.options.show_header {
            match serde_json::to_value(&header) {
                Ok(v) => self.reporter.report(&Event::header(flow, v)),
                Err(e) => debug!(%flow, error = %e, "header not serializable"),
            }
        }

        let decrypted = match decrypt_trial(&self.codec, &header, ciphertext, &self.keys) {
            Ok(d) => d,
            Err(e) => {
                info!(
                    %flow,
                    attempts = e.attempts,
                    error = %e.last,
                    header = ?header,
                    ciphertext = %hex::encode(ciphertext),
                    "unable to decrypt payload"
                );
                return;
            }
        };
        debug!(%flow, keyed = decrypted.key.is_some(), "payload decrypted");

        if self.options.show_message {
            self.reporter.report(&Event::message(flow, &decrypted.plaintext));
        }

        // Facts surface in the controller's replies, so they belong to the receiver.
        if let Err(e) = self.extractor.extract(&decrypted.plaintext, flow.dst) {
            debug!(%flow, source = %flow.src, error = %e, "payload not extractable");
        }
    }
}

impl<C: EnvelopeCodec> MessageHandler for Classifier<C> {
    fn handle(&self, flow: &FlowKey, message: HttpMessage) {
        match classify(&message) {
            Disposition::Accept => self.envelope(flow, &message.body),
            Disposition::Ignore => {}
            Disposition::Unhandled => {
                warn!(
                    %flow,
                    status = message.status(),
                    content_type = message.content_type(),
                    "unhandled response"
                );
            }
        }
    }
}
