//! HTTP/1.x message reader for reassembled flows.
//!
//! Reads exactly one message off a buffered stream so that pipelined and
//! keep-alive exchanges can be consumed in a loop. Bodies are framed by
//! chunked transfer encoding, Content-Length, or (responses only) the
//! end of the stream.

use httparse::{Status, EMPTY_HEADER};
use std::io::{BufRead, Read};

use crate::error::HttpError;

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 64;

/// Parsed HTTP message (request or response).
#[derive(Debug, Clone)]
pub struct HttpMessage {
    pub kind: HttpKind,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpKind {
    Request {
        method: String,
        uri: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

impl HttpMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Media type of the body without parameters, e.g. `application/json`.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|v| v.split(';').next().unwrap_or("").trim())
    }

    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            HttpKind::Request { method, .. } => Some(method),
            HttpKind::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.kind {
            HttpKind::Response { status, .. } => Some(*status),
            HttpKind::Request { .. } => None,
        }
    }

    fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    fn content_length(&self) -> Result<Option<usize>, HttpError> {
        match self.header("content-length") {
            Some(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| HttpError::Malformed(format!("bad content-length {:?}", v))),
            None => Ok(None),
        }
    }
}

/// Size limits applied while reading one message.
#[derive(Debug, Clone, Copy)]
pub struct HttpLimits {
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        HttpLimits {
            max_head_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Read one request, head and body.
pub fn read_request<R: BufRead>(reader: &mut R, limits: &HttpLimits) -> Result<HttpMessage, HttpError> {
    let head = read_head(reader, limits)?;
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&head) {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => return Err(HttpError::Malformed("partial request head".into())),
        Err(e) => return Err(HttpError::Malformed(e.to_string())),
    }

    let mut msg = HttpMessage {
        kind: HttpKind::Request {
            method: req.method.unwrap_or_default().to_string(),
            uri: req.path.unwrap_or_default().to_string(),
            version: version_string(req.version),
        },
        headers: collect_headers(req.headers),
        body: Vec::new(),
    };

    msg.body = if msg.is_chunked() {
        read_chunked(reader, limits)?
    } else {
        match msg.content_length()? {
            Some(len) => read_exact_body(reader, len, limits)?,
            None => Vec::new(),
        }
    };
    Ok(msg)
}

/// Read one response, head and body.
pub fn read_response<R: BufRead>(reader: &mut R, limits: &HttpLimits) -> Result<HttpMessage, HttpError> {
    let head = read_head(reader, limits)?;
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(&head) {
        Ok(Status::Complete(_)) => {}
        Ok(Status::Partial) => return Err(HttpError::Malformed("partial response head".into())),
        Err(e) => return Err(HttpError::Malformed(e.to_string())),
    }

    let status = res.code.unwrap_or(0);
    let mut msg = HttpMessage {
        kind: HttpKind::Response {
            version: version_string(res.version),
            status,
            reason: res.reason.unwrap_or_default().to_string(),
        },
        headers: collect_headers(res.headers),
        body: Vec::new(),
    };

    msg.body = if (100..200).contains(&status) || status == 204 || status == 304 {
        Vec::new()
    } else if msg.is_chunked() {
        read_chunked(reader, limits)?
    } else {
        match msg.content_length()? {
            Some(len) => read_exact_body(reader, len, limits)?,
            None => read_to_close(reader, limits)?,
        }
    };
    Ok(msg)
}

fn version_string(minor: Option<u8>) -> String {
    match minor {
        Some(v) => format!("HTTP/1.{}", v),
        None => "HTTP/1.1".to_string(),
    }
}

fn collect_headers(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

/// Consume lines up to and including the blank line ending the head.
fn read_head<R: BufRead>(reader: &mut R, limits: &HttpLimits) -> Result<Vec<u8>, HttpError> {
    let mut head = Vec::with_capacity(512);
    loop {
        let start = head.len();
        let n = reader
            .by_ref()
            .take((limits.max_head_bytes + 1 - start.min(limits.max_head_bytes)) as u64)
            .read_until(b'\n', &mut head)?;
        if n == 0 {
            return Err(HttpError::Incomplete { read: head.len() });
        }
        if head.len() > limits.max_head_bytes {
            return Err(HttpError::HeaderTooLarge {
                limit: limits.max_head_bytes,
            });
        }
        let line = &head[start..];
        if !line.ends_with(b"\n") {
            return Err(HttpError::Incomplete { read: head.len() });
        }
        if start > 0 && (line == b"\r\n" || line == b"\n") {
            return Ok(head);
        }
    }
}

fn read_exact_body<R: BufRead>(reader: &mut R, len: usize, limits: &HttpLimits) -> Result<Vec<u8>, HttpError> {
    if len > limits.max_body_bytes {
        return Err(HttpError::BodyTooLarge {
            len,
            limit: limits.max_body_bytes,
        });
    }
    let mut body = Vec::with_capacity(len.min(64 * 1024));
    reader.by_ref().take(len as u64).read_to_end(&mut body)?;
    if body.len() < len {
        return Err(HttpError::Incomplete { read: body.len() });
    }
    Ok(body)
}

fn read_to_close<R: BufRead>(reader: &mut R, limits: &HttpLimits) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();
    reader
        .by_ref()
        .take(limits.max_body_bytes as u64 + 1)
        .read_to_end(&mut body)?;
    if body.len() > limits.max_body_bytes {
        return Err(HttpError::BodyTooLarge {
            len: body.len(),
            limit: limits.max_body_bytes,
        });
    }
    Ok(body)
}

fn read_chunked<R: BufRead>(reader: &mut R, limits: &HttpLimits) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();
    loop {
        let line = read_line(reader)?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| HttpError::BadChunk(format!("bad chunk size {:?}", size_field)))?;

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                if read_line(reader)?.is_empty() {
                    return Ok(body);
                }
            }
        }

        let total = body.len().saturating_add(size);
        if total > limits.max_body_bytes {
            return Err(HttpError::BodyTooLarge {
                len: total,
                limit: limits.max_body_bytes,
            });
        }
        let before = body.len();
        reader.by_ref().take(size as u64).read_to_end(&mut body)?;
        if body.len() - before < size {
            return Err(HttpError::Incomplete { read: body.len() });
        }
        if !read_line(reader)?.is_empty() {
            return Err(HttpError::BadChunk("missing CRLF after chunk data".into()));
        }
    }
}

/// One line without its terminator. End of stream is `Incomplete`.
fn read_line<R: BufRead>(reader: &mut R) -> Result<String, HttpError> {
    let mut line = Vec::new();
    let n = reader.by_ref().take(4096).read_until(b'\n', &mut line)?;
    if n == 0 || !line.ends_with(b"\n") {
        return Err(HttpError::Incomplete { read: line.len() });
    }
    let text = String::from_utf8_lossy(&line);
    Ok(text.trim_end_matches(['\r', '\n']).to_string())
}
