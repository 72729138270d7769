//! Exchange model
//!
//! An exchange is one captured HTTP request/response pair, the unit of
//! storage and of the event stream.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One captured request/response pair.
///
/// Created with `status == 0` when the proxy has read a complete request
/// head; updated exactly once when the response finishes (or the exchange
/// fails); immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    /// Store-assigned id, strictly increasing in insertion order
    pub id: i64,
    /// Wall-clock milliseconds at request-head arrival
    pub timestamp_ms: i64,
    /// Request method, verbatim as sent (e.g. "GET")
    pub method: String,
    /// Absolute request URL
    pub url: String,
    /// Authority component of `url` (host, plus `:port` when non-default)
    pub host: String,
    /// Request path including the query string
    pub path: String,
    /// Response status; 0 while no response has been recorded
    pub status: u16,
    /// Request headers as observed on the wire, case preserved,
    /// duplicate names collapsed to the last occurrence
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<Vec<u8>>,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_body: Option<Vec<u8>>,
    /// Response `Content-Type`, lowercased, parameters retained
    pub content_type: Option<String>,
    pub duration_ms: u64,
    /// Total response-body bytes relayed on the wire
    pub size_bytes: u64,
    /// The captured request body was cut off at the capture cap
    pub request_truncated: bool,
    /// The captured response body was cut off at the capture cap
    pub response_truncated: bool,
    /// Error-kind pseudo-field for failed exchanges (e.g. "UPSTREAM_CONNECT")
    pub error_kind: Option<String>,
}

/// Request-side fields handed to `TrafficStore::insert_open`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenExchange {
    pub timestamp_ms: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<Vec<u8>>,
    pub request_truncated: bool,
}

impl OpenExchange {
    /// Materialize the pending row this open exchange represents.
    pub fn into_exchange(self, id: i64) -> Exchange {
        Exchange {
            id,
            timestamp_ms: self.timestamp_ms,
            method: self.method,
            url: self.url,
            host: self.host,
            path: self.path,
            status: 0,
            request_headers: self.request_headers,
            request_body: self.request_body,
            response_headers: None,
            response_body: None,
            content_type: None,
            duration_ms: 0,
            size_bytes: 0,
            request_truncated: self.request_truncated,
            response_truncated: false,
            error_kind: None,
        }
    }
}

/// Response-side fields handed to `TrafficStore::complete`.
///
/// `request_body` is carried here as well because the engine streams
/// request bodies after the row is opened; `None` leaves whatever
/// `insert_open` recorded untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeCompletion {
    pub status: u16,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub duration_ms: u64,
    pub size_bytes: u64,
    pub response_truncated: bool,
    pub error_kind: Option<String>,
    pub request_body: Option<Vec<u8>>,
    pub request_truncated: Option<bool>,
}

impl ExchangeCompletion {
    /// Apply this completion to a pending exchange.
    pub fn apply(self, exchange: &mut Exchange) {
        exchange.status = self.status;
        exchange.response_headers = self.response_headers;
        exchange.response_body = self.response_body;
        exchange.content_type = self.content_type;
        exchange.duration_ms = self.duration_ms;
        exchange.size_bytes = self.size_bytes;
        exchange.response_truncated = self.response_truncated;
        exchange.error_kind = self.error_kind;
        if let Some(body) = self.request_body {
            exchange.request_body = Some(body);
        }
        if let Some(truncated) = self.request_truncated {
            exchange.request_truncated = truncated;
        }
    }
}

/// Status-code bucket used by [`ExchangeFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusBucket {
    #[serde(rename = "2xx")]
    Success,
    #[serde(rename = "3xx")]
    Redirection,
    #[serde(rename = "4xx")]
    ClientError,
    #[serde(rename = "5xx")]
    ServerError,
}

impl StatusBucket {
    /// Inclusive status range the bucket expands to.
    pub fn range(&self) -> (u16, u16) {
        match self {
            StatusBucket::Success => (200, 299),
            StatusBucket::Redirection => (300, 399),
            StatusBucket::ClientError => (400, 499),
            StatusBucket::ServerError => (500, 599),
        }
    }
}

impl std::str::FromStr for StatusBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2xx" => Ok(StatusBucket::Success),
            "3xx" => Ok(StatusBucket::Redirection),
            "4xx" => Ok(StatusBucket::ClientError),
            "5xx" => Ok(StatusBucket::ServerError),
            other => Err(format!("unknown status bucket: {other}")),
        }
    }
}

/// Conjunctive query over stored exchanges.
///
/// Empty collections and `None` fields mean "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeFilter {
    /// Case-insensitive substring matched against `url`, `host` and `path`
    pub text: Option<String>,
    /// Exact method names (e.g. `["GET", "POST"]`)
    pub methods: Vec<String>,
    pub status_buckets: Vec<StatusBucket>,
    /// Exact authority strings as stored in `Exchange::host`
    pub hosts: Vec<String>,
    /// Case-insensitive substrings matched against `content_type`
    pub content_types: Vec<String>,
    /// Inclusive lower bound on `timestamp_ms`
    pub from_ms: Option<i64>,
    /// Inclusive upper bound on `timestamp_ms`
    pub to_ms: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_ranges_are_inclusive_centuries() {
        assert_eq!(StatusBucket::Success.range(), (200, 299));
        assert_eq!(StatusBucket::ServerError.range(), (500, 599));
        assert_eq!("3xx".parse::<StatusBucket>(), Ok(StatusBucket::Redirection));
        assert!("6xx".parse::<StatusBucket>().is_err());
    }

    #[test]
    fn completion_preserves_request_body_when_absent() {
        let open = OpenExchange {
            timestamp_ms: 1,
            method: "POST".into(),
            url: "http://a.test/x".into(),
            host: "a.test".into(),
            path: "/x".into(),
            request_body: Some(b"payload".to_vec()),
            ..Default::default()
        };
        let mut exchange = open.into_exchange(9);
        ExchangeCompletion {
            status: 201,
            duration_ms: 12,
            ..Default::default()
        }
        .apply(&mut exchange);
        assert_eq!(exchange.status, 201);
        assert_eq!(exchange.request_body.as_deref(), Some(&b"payload"[..]));
    }
}
