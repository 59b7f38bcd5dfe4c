//! Sans-IO parser for incoming HAP requests
//!
//! The connection task feeds decrypted bytes in and pulls complete
//! requests out; no I/O happens here.

use std::str::{self, FromStr};

use bytes::BytesMut;

use super::{Headers, HttpRequest, Method};

/// Errors during request parsing
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid request line: {0}")]
    InvalidRequestLine(String),

    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("body too large: {size} > {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("invalid UTF-8 in headers")]
    InvalidUtf8,
}

/// Maximum allowed body size; HAP bodies are small JSON/TLV payloads.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Maximum header section size
const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Incremental request parser over an internal byte buffer
///
/// - `feed()` adds decrypted bytes
/// - `decode()` attempts to parse one complete request
pub struct HttpServerCodec {
    buffer: BytesMut,
}

impl HttpServerCodec {
    /// Create a new codec
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Feed bytes into the internal buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes currently buffered
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Attempt to decode one complete request.
    ///
    /// Returns `Ok(None)` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if the buffered request is malformed; the
    /// caller must treat this as connection-fatal since framing is lost.
    pub fn decode(&mut self) -> Result<Option<HttpRequest>, ParseError> {
        let Some(header_end) = self.find_header_end() else {
            if self.buffer.len() > MAX_HEADER_SIZE {
                return Err(ParseError::InvalidHeader("headers too large".into()));
            }
            return Ok(None);
        };

        let header_bytes = &self.buffer[..header_end];
        let header_str = str::from_utf8(header_bytes).map_err(|_| ParseError::InvalidUtf8)?;

        let (method, uri, headers) = Self::parse_headers(header_str)?;

        let content_length = headers
            .get("Content-Length")
            .map(str::parse::<usize>)
            .transpose()
            .map_err(|_| ParseError::InvalidContentLength("not a number".into()))?
            .unwrap_or(0);

        if content_length > MAX_BODY_SIZE {
            return Err(ParseError::BodyTooLarge {
                size: content_length,
                max: MAX_BODY_SIZE,
            });
        }

        let total_size = header_end + 4 + content_length;
        if self.buffer.len() < total_size {
            return Ok(None);
        }

        let _ = self.buffer.split_to(header_end + 4);
        let body = if content_length > 0 {
            self.buffer.split_to(content_length).to_vec()
        } else {
            Vec::new()
        };

        Ok(Some(HttpRequest {
            method,
            uri,
            headers,
            body,
        }))
    }

    fn find_header_end(&self) -> Option<usize> {
        let needle = b"\r\n\r\n";
        self.buffer
            .windows(needle.len())
            .position(|window| window == needle)
    }

    fn parse_headers(header_str: &str) -> Result<(Method, String, Headers), ParseError> {
        let mut lines = header_str.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| ParseError::InvalidRequestLine("empty request".into()))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(ParseError::InvalidRequestLine(request_line.to_string()));
        }

        let method = Method::from_str(parts[0])
            .map_err(|()| ParseError::InvalidMethod(parts[0].to_string()))?;
        let uri = parts[1].to_string();

        if !parts[2].starts_with("HTTP/") {
            return Err(ParseError::InvalidRequestLine(format!(
                "invalid protocol: {}",
                parts[2]
            )));
        }

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                break;
            }

            if let Some(pos) = line.find(':') {
                headers.insert(line[..pos].trim(), line[pos + 1..].trim());
            } else {
                return Err(ParseError::InvalidHeader(line.to_string()));
            }
        }

        Ok((method, uri, headers))
    }
}

impl Default for HttpServerCodec {
    fn default() -> Self {
        Self::new()
    }
}
