//! Response and event-frame rendering

use super::Headers;

/// A response ready to encode onto the wire
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Numeric status code
    pub status: u16,
    /// Response headers
    pub headers: Headers,
    /// Response body
    pub body: Vec<u8>,
}

/// Fluent builder for HAP responses
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    status: u16,
    headers: Headers,
    body: Option<Vec<u8>>,
}

impl ResponseBuilder {
    /// Create a builder for the given status
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: None,
        }
    }

    /// 200 OK
    #[must_use]
    pub fn ok() -> Self {
        Self::new(200)
    }

    /// 204 No Content
    #[must_use]
    pub fn no_content() -> Self {
        Self::new(204)
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body with a content type
    #[must_use]
    pub fn body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.headers.insert("Content-Type", content_type);
        self.body = Some(body);
        self
    }

    /// Build the response
    #[must_use]
    pub fn build(mut self) -> HttpResponse {
        if let Some(ref body) = self.body {
            self.headers.insert("Content-Length", body.len().to_string());
        }
        HttpResponse {
            status: self.status,
            headers: self.headers,
            body: self.body.unwrap_or_default(),
        }
    }

    /// Build and encode directly to bytes
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        encode_response(&self.build())
    }
}

/// Encode a response with an `HTTP/1.1` status line
#[must_use]
pub fn encode_response(response: &HttpResponse) -> Vec<u8> {
    encode_with_protocol("HTTP/1.1", response)
}

/// Encode an out-of-band event frame with the `EVENT/1.0` status line.
///
/// Event frames share the response wire shape but a distinct protocol
/// token, so controllers can tell them apart from in-flight responses.
#[must_use]
pub fn encode_event(body: &[u8], content_type: &str) -> Vec<u8> {
    let mut headers = Headers::new();
    headers.insert("Content-Type", content_type);
    headers.insert("Content-Length", body.len().to_string());
    encode_with_protocol(
        "EVENT/1.0",
        &HttpResponse {
            status: 200,
            headers,
            body: body.to_vec(),
        },
    )
}

fn encode_with_protocol(protocol: &str, response: &HttpResponse) -> Vec<u8> {
    let mut output = Vec::with_capacity(128 + response.body.len());

    output.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            protocol,
            response.status,
            status_reason(response.status)
        )
        .as_bytes(),
    );

    for (name, value) in response.headers.iter() {
        output.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    output.extend_from_slice(b"\r\n");
    output.extend_from_slice(&response.body);

    output
}

/// Reason phrase for a status code
fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        207 => "Multi-Status",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        470 => "Connection Authorization Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http::content_type;

    #[test]
    fn encodes_status_line_and_body() {
        let encoded = ResponseBuilder::ok()
            .body(b"{\"status\":0}".to_vec(), content_type::HAP_JSON)
            .encode();

        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/hap+json\r\n"));
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"status\":0}"));
    }

    #[test]
    fn multi_status_reason_phrase() {
        let encoded = ResponseBuilder::new(207).encode();
        assert!(String::from_utf8(encoded).unwrap().starts_with("HTTP/1.1 207 Multi-Status"));
    }

    #[test]
    fn event_frames_use_event_protocol() {
        let encoded = encode_event(b"{}", content_type::HAP_JSON);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("EVENT/1.0 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }
}
