//! HTTP/1.1-shaped request/response framing for the HAP transport
//!
//! HAP speaks pseudo-HTTP over its own encrypted channel, so nothing here
//! touches sockets: [`codec::HttpServerCodec`] parses requests out of a
//! byte buffer and [`response::ResponseBuilder`] renders responses,
//! including the out-of-band `EVENT/1.0` frames.

pub mod codec;
pub mod response;

pub use codec::{HttpServerCodec, ParseError};
pub use response::{HttpResponse, ResponseBuilder, encode_event, encode_response};

/// Body content types used by HAP
pub mod content_type {
    /// JSON bodies for accessories/characteristics
    pub const HAP_JSON: &str = "application/hap+json";
    /// TLV8 bodies for the pairing endpoints
    pub const PAIRING_TLV8: &str = "application/pairing+tlv8";
    /// Snapshot images from `/resource`
    pub const IMAGE_JPEG: &str = "image/jpeg";
}

/// Request methods HAP uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// PUT
    Put,
    /// POST
    Post,
}

impl std::str::FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            "POST" => Ok(Self::Post),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
        })
    }
}

/// Ordered, case-insensitive header map
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing an existing one of the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Look up a header by name, case-insensitively
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// A parsed HAP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method
    pub method: Method,
    /// Raw request target, query string included
    pub uri: String,
    /// Request headers
    pub headers: Headers,
    /// Request body
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Path portion of the URI (before any `?`)
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }

    /// Query string, if any
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    /// Value of one query parameter
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_query_split() {
        let request = HttpRequest {
            method: Method::Get,
            uri: "/characteristics?id=1.9,2.14&meta=1".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        };
        assert_eq!(request.path(), "/characteristics");
        assert_eq!(request.query_param("id"), Some("1.9,2.14"));
        assert_eq!(request.query_param("meta"), Some("1"));
        assert_eq!(request.query_param("perms"), None);
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/hap+json");
        assert_eq!(headers.get("content-type"), Some("application/hap+json"));
        headers.insert("content-type", "application/pairing+tlv8");
        assert_eq!(headers.get("Content-Type"), Some("application/pairing+tlv8"));
        assert_eq!(headers.iter().count(), 1);
    }
}
