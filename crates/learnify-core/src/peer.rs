//! A nearby device discovered through an advertisement.

use serde::{Deserialize, Serialize};

/// A discovered peer.
///
/// `name` is the advertised instance name and doubles as the identity key:
/// a second resolution under the same name replaces the first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub item_count: u32,
}

impl Peer {
    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
