//! Learnify wire format: the peer transfer protocol and discovery datagrams.
//!
//! The transfer protocol is a deliberately small subset of HTTP/1.1:
//!
//! ```text
//! Request  := METHOD SP PATH [SP VERSION] CRLF *(header-line CRLF) CRLF
//! Response := "HTTP/1.1" SP STATUS SP REASON CRLF
//!             "Content-Type:" SP type CRLF
//!             "Content-Length:" SP byte-length CRLF
//!             "Connection: close" CRLF CRLF
//!             body
//! ```
//!
//! One request per connection. Every supported request is a bodyless GET,
//! so the blank line that ends the head also ends the request. A route that
//! needs a request body would have to move to a Content-Length aware reader.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Service type both sides advertise and browse for.
pub const SERVICE_TYPE: &str = "learnify";
pub const SERVICE_PROTOCOL: &str = "tcp";
pub const SERVICE_DOMAIN: &str = "local.";

/// Transfer server port both sides default to.
pub const DEFAULT_PORT: u16 = 53319;

/// TXT key carrying the number of shared videos as a decimal string.
pub const TXT_ITEM_COUNT: &str = "itemCount";

/// End of a request or response head.
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Longest request head the server will buffer before giving up on it.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_VIDEO: &str = "video/mp4";

/// Fully qualified service name, e.g. `_learnify._tcp.local.`
pub fn service_name() -> String {
    format!("_{SERVICE_TYPE}._{SERVICE_PROTOCOL}.{SERVICE_DOMAIN}")
}

/// On-air service identifier: BLAKE3 of the service name, hex encoded.
/// Receivers drop datagrams that carry any other identifier.
pub fn service_id() -> String {
    hex::encode(blake3::hash(service_name().as_bytes()).as_bytes())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("head is not terminated by a blank line")]
    Incomplete,
    #[error("malformed request line: {0:?}")]
    BadRequestLine(String),
    #[error("malformed status line: {0:?}")]
    BadStatusLine(String),
    #[error("invalid Content-Length: {0:?}")]
    BadContentLength(String),
    #[error("head is not valid UTF-8")]
    NotUtf8,
    #[error("invalid datagram: {0}")]
    BadDatagram(#[from] serde_json::Error),
    #[error("datagram for foreign service {0}")]
    ForeignService(String),
}

/// Offset just past the head terminator, if the buffer holds a full head.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Path with any query string removed.
    pub path: String,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
        }
    }

    /// Parse a complete request head. Header lines are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let end = head_len(buf).ok_or(WireError::Incomplete)?;
        let head = std::str::from_utf8(&buf[..end]).map_err(|_| WireError::NotUtf8)?;
        let line = head.split("\r\n").next().unwrap_or_default();

        let mut parts = line.split(' ');
        let method = parts.next().unwrap_or_default();
        let target = parts.next().unwrap_or_default();
        if method.is_empty() || !target.starts_with('/') {
            return Err(WireError::BadRequestLine(line.to_string()));
        }
        let path = target.split('?').next().unwrap_or(target);

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
        })
    }

    /// Serialize as sent by the transfer client.
    pub fn encode(&self, host: &str) -> Vec<u8> {
        format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.method, self.path, host
        )
        .into_bytes()
    }
}

/// Transfer server routes, matched in this order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Info,
    Videos,
    VideoMeta(String),
    VideoFile(String),
    NotFound,
}

impl Route {
    pub fn resolve(request: &Request) -> Self {
        if request.method != "GET" {
            return Route::NotFound;
        }
        match request.path.as_str() {
            "/info" => return Route::Info,
            "/videos" => return Route::Videos,
            _ => {}
        }

        let segments: Vec<&str> = request.path.split('/').collect();
        match segments.as_slice() {
            ["", "video", id, "meta"] if !id.is_empty() => Route::VideoMeta(id.to_string()),
            ["", "video", id, "file"] if !id.is_empty() => Route::VideoFile(id.to_string()),
            _ => Route::NotFound,
        }
    }

    pub fn meta_path(video_id: &str) -> String {
        format!("/video/{video_id}/meta")
    }

    pub fn file_path(video_id: &str) -> String {
        format!("/video/{video_id}/file")
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    InternalServerError,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NotFound => 404,
            Status::InternalServerError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "Not Found",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

/// Response status line plus the two headers the protocol carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: String,
    /// Exact byte length of the body.
    pub content_length: u64,
}

impl ResponseHead {
    pub fn new(status: Status, content_type: &str, content_length: u64) -> Self {
        Self {
            status: status.code(),
            content_type: content_type.to_string(),
            content_length,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn encode(&self) -> Vec<u8> {
        let reason = match self.status {
            200 => Status::Ok.reason(),
            404 => Status::NotFound.reason(),
            _ => Status::InternalServerError.reason(),
        };
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status, reason, self.content_type, self.content_length
        )
        .into_bytes()
    }

    /// Parse a complete response head. Unknown headers are ignored; a missing
    /// Content-Length reads as 0.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let end = head_len(buf).ok_or(WireError::Incomplete)?;
        let head = std::str::from_utf8(&buf[..end]).map_err(|_| WireError::NotUtf8)?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|_| version.starts_with("HTTP/"))
            .ok_or_else(|| WireError::BadStatusLine(status_line.to_string()))?;

        let mut content_type = String::new();
        let mut content_length = 0;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-type") {
                content_type = value.to_string();
            } else if name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .parse()
                    .map_err(|_| WireError::BadContentLength(value.to_string()))?;
            }
        }

        Ok(Self {
            status,
            content_type,
            content_length,
        })
    }
}

// ── Discovery datagrams ───────────────────────────────────────────────────────

/// Multicast advertisement datagram, JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Announcement {
    Announce {
        service: String,
        instance: String,
        host: String,
        port: u16,
        #[serde(default)]
        txt: BTreeMap<String, String>,
    },
    Withdraw {
        service: String,
        instance: String,
    },
}

impl Announcement {
    pub fn announce(instance: &str, host: &str, port: u16, txt: BTreeMap<String, String>) -> Self {
        Announcement::Announce {
            service: service_id(),
            instance: instance.to_string(),
            host: host.to_string(),
            port,
            txt,
        }
    }

    pub fn withdraw(instance: &str) -> Self {
        Announcement::Withdraw {
            service: service_id(),
            instance: instance.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a datagram, rejecting announcements for any other service.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let ann: Announcement = serde_json::from_slice(buf)?;
        let service = match &ann {
            Announcement::Announce { service, .. } | Announcement::Withdraw { service, .. } => {
                service
            }
        };
        if *service != service_id() {
            return Err(WireError::ForeignService(service.clone()));
        }
        Ok(ann)
    }
}
