//! Error types for the harvesting pipeline.
//!
//! Every error here is recoverable at the scope it is raised in: a bad
//! message is dropped, a broken flow ends its own worker. Only the binary
//! turns failures into a non-zero exit (through `anyhow`), and only for the
//! capture file and an explicitly configured key file.

use thiserror::Error;

/// Failure reading one HTTP message off a flow.
#[derive(Error, Debug)]
pub enum HttpError {
    /// Stream ended before the message was complete.
    #[error("incomplete message: stream ended after {read} bytes")]
    Incomplete { read: usize },

    /// Header block grew beyond the configured limit without a terminator.
    #[error("header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    /// Start line or headers rejected by the parser.
    #[error("malformed message head: {0}")]
    Malformed(String),

    /// Chunked transfer encoding could not be decoded.
    #[error("bad chunk: {0}")]
    BadChunk(String),

    /// Declared or accumulated body exceeds the configured limit.
    #[error("body of {len} bytes exceeds limit of {limit}")]
    BodyTooLarge { len: usize, limit: usize },

    /// Underlying stream failure (not end-of-stream).
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure decoding an inform envelope.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("header truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("bad magic {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("payload is encrypted and no key was given")]
    MissingKey,

    #[error("key is not 32 hex characters")]
    InvalidKey,

    #[error("authenticated decryption failed")]
    Decrypt,

    #[error("bad block padding")]
    Padding,

    #[error("ciphertext length {0} is not a whole number of blocks")]
    BlockLength(usize),

    #[error("decrypted payload is not a document")]
    Unverified,

    #[error("unsupported payload encoding: {0}")]
    Unsupported(&'static str),

    #[error("zlib inflate failed: {0}")]
    Decompress(std::io::Error),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Every candidate key (and the no-key path) failed on one message.
#[derive(Error, Debug)]
#[error("no candidate key decrypted the payload after {attempts} attempts: {last}")]
pub struct DecryptExhausted {
    pub attempts: usize,
    #[source]
    pub last: CodecError,
}

/// Decrypted bytes were not a structured document even after substitution.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("payload is not a JSON document: {0}")]
    Structure(#[from] serde_json::Error),
}

/// Failure from the geolocation collaborator.
#[derive(Error, Debug)]
pub enum GeoError {
    /// No API credential configured. A normal skip, not a fault.
    #[error("no geolocation credential configured")]
    NoCredential,

    #[error("geolocation request failed: {0}")]
    Request(String),

    #[error("geolocation response unreadable: {0}")]
    Response(String),
}

impl GeoError {
    pub fn is_skip(&self) -> bool {
        matches!(self, GeoError::NoCredential)
    }
}
