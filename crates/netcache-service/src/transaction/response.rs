use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// The response metadata stored in the [`ResponseInfo`](crate::caching::DataStream::ResponseInfo)
/// stream of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// The HTTP status code.
    pub status: u16,
    /// The response headers.
    pub headers: Vec<(String, String)>,
    /// When the request was sent.
    pub request_time: SystemTime,
    /// When the response headers were received.
    pub response_time: SystemTime,
    /// Set when only a prefix of the response content is stored.
    #[serde(default)]
    pub truncated: bool,
}

impl ResponseInfo {
    /// Creates the metadata for a response that was just received.
    pub fn fresh(status: u16, headers: Vec<(String, String)>) -> Self {
        let now = SystemTime::now();
        Self {
            status,
            headers,
            request_time: now,
            response_time: now,
            truncated: false,
        }
    }

    /// Returns the value of the first header called `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
