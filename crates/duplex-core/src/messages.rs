//! Request and response records exchanged over a duplex connection.
//!
//! Both records are immutable once decoded. A [`Request`] without an id is
//! fire-and-forget: the peer does not expect a [`Response`] for it.

use std::collections::BTreeMap;

/// Header map: name to every value sent under that name, in order.
pub type Headers = BTreeMap<String, Vec<String>>;

/// A request travelling in either direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    /// Correlation id. `None` means no reply is expected.
    pub id: Option<u64>,
    /// Verb, e.g. `GET` or `PUT`.
    pub verb: String,
    /// Path including an optional `?query` suffix.
    pub path: String,
    /// Request headers.
    pub headers: Headers,
    /// Optional body bytes.
    pub body: Option<Vec<u8>>,
}

impl Request {
    /// Create a fire-and-forget request with no headers or body.
    pub fn new(verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: None,
            verb: verb.into(),
            path: path.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Append a header value.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether the sender expects a correlated response.
    pub fn expects_reply(&self) -> bool {
        self.id.is_some()
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        first_header(&self.headers, name)
    }

    /// The path with any query string removed.
    pub fn path_only(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(p, _)| p)
    }

    /// Raw `key=value` pairs of the query string, in order.
    ///
    /// A key without `=` yields an empty value. Empty segments are skipped.
    pub fn query_pairs(&self) -> Vec<(&str, &str)> {
        let Some((_, query)) = self.path.split_once('?') else {
            return Vec::new();
        };
        query
            .split('&')
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.split_once('=').unwrap_or((segment, "")))
            .collect()
    }
}

/// A response correlated to an earlier request by id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    /// Id of the request this answers.
    pub request_id: u64,
    /// HTTP-style status code.
    pub status: u16,
    /// Short status message.
    pub message: String,
    /// Response headers.
    pub headers: Headers,
    /// Optional body bytes.
    pub body: Option<Vec<u8>>,
}

impl Response {
    /// Create a response with no headers or body.
    pub fn new(request_id: u64, status: u16, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status,
            message: message.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        first_header(&self.headers, name)
    }
}

/// A decoded wire message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// A request from the peer.
    Request(Request),
    /// A response to a request this side sent.
    Response(Response),
    /// A well-formed envelope of a kind this side does not understand.
    Unknown {
        /// The kind tag as it appeared on the wire.
        kind: String,
    },
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

fn first_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}
