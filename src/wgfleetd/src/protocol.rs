//! Newline-delimited JSON protocol spoken over the daemon's Unix domain
//! socket: one `Request` in, one `Response` out, per connection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    Open {
        tunnel_id: String,
        peer_endpoint: String,
        peer_port: u16,
        peer_public_key: String,
        ttl_secs: u64,
    },
    Close {
        tunnel_id: String,
    },
    Extend {
        tunnel_id: String,
        by_secs: u64,
    },
    List,
    Show {
        tunnel_id: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusDto {
    pub tunnel_id: String,
    pub interface_id: String,
    pub state: String,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub latest_handshake: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    List(Vec<String>),
    Status(StatusDto),
    Error(String),
}
