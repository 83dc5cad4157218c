//! Wire protocol for the discovery broker (§6.3 "Broker discovery
//! protocol"): three request/reply message pairs, carried as
//! length-prefixed JSON frames (a 4-byte big-endian length followed by
//! the JSON body) over a Unix domain socket.
//!
//! The broker is informational only: a consumer that already has the
//! `shm_name` and secret out-of-band can attach without ever contacting
//! it. No payload data crosses this protocol.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Registration of a channel's shared-memory segment (§6.3 `REG_REQ`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Logical channel name.
    pub channel: String,
    /// Name of the underlying shared-memory segment.
    pub shm_name: String,
    /// Schema hash, hex-encoded (32 bytes -> 64 hex chars), or empty if
    /// schema checking is disabled for this channel.
    pub schema_hash: String,
    /// SHA-256 (or equivalent) hash of the shared secret, never the
    /// secret itself — the broker is a discovery service, not a key
    /// store.
    pub secret_hash: String,
    /// Optional out-of-band notification endpoint (e.g. a pub/sub topic
    /// consumers can subscribe to for "commit_index advanced" pings).
    pub endpoint: Option<String>,
}

/// Lookup of a previously registered channel (§6.3 `DISC_REQ`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    /// Logical channel name.
    pub channel: String,
    /// Hash of the secret the caller claims to hold, checked against the
    /// value supplied at registration.
    pub secret_hash: String,
}

/// De-registration of a channel, typically issued by the producer on
/// clean shutdown (§6.3 `DEREG_REQ`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterRequest {
    /// Logical channel name.
    pub channel: String,
}

/// Every request type the broker accepts, tagged by `type` in the JSON
/// encoding so the server can dispatch without probing field sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// §6.3 `REG_REQ`.
    #[serde(rename = "REG_REQ")]
    Register(RegisterRequest),
    /// §6.3 `DISC_REQ`.
    #[serde(rename = "DISC_REQ")]
    Discover(DiscoverRequest),
    /// §6.3 `DEREG_REQ`.
    #[serde(rename = "DEREG_REQ")]
    Deregister(DeregisterRequest),
}

/// Reply to a successful [`DiscoverRequest`] (§6.3 `DISC_REQ` ->
/// `{OK, shm_name, schema_hash, endpoint?}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverOk {
    /// Name of the underlying shared-memory segment.
    pub shm_name: String,
    /// Schema hash, hex-encoded.
    pub schema_hash: String,
    /// Optional notification endpoint, if the registrant supplied one.
    pub endpoint: Option<String>,
}

/// Every reply the broker sends, tagged by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Reply {
    /// Registration or de-registration succeeded.
    #[serde(rename = "OK")]
    Ok,
    /// Discovery succeeded, with the looked-up channel's details.
    #[serde(rename = "OK_DISCOVER")]
    OkDiscover(DiscoverOk),
    /// Registration failed because the channel name is already taken by
    /// a different, still-live registration.
    #[serde(rename = "CONFLICT")]
    Conflict,
    /// Discovery failed because the channel name is unknown.
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    /// Discovery failed because `secret_hash` did not match the
    /// registered value.
    #[serde(rename = "AUTH_FAILED")]
    AuthFailed,
    /// A malformed request or an internal server error.
    #[serde(rename = "ERROR")]
    Error {
        /// Human-readable reason.
        reason: String,
    },
}

/// Read one length-prefixed JSON frame from `reader`: a 4-byte
/// big-endian length followed by that many bytes of JSON.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Write one length-prefixed JSON frame to `writer`.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len)?;
    writer.write_all(body)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_round_trips_through_json() {
        let req = Request::Register(RegisterRequest {
            channel: "ticks".to_string(),
            shm_name: "ticks".to_string(),
            schema_hash: "ab".repeat(32),
            secret_hash: "cd".repeat(32),
            endpoint: Some("tcp://127.0.0.1:9000".to_string()),
        });
        let json = serde_json::to_vec(&req).unwrap();
        let decoded: Request = serde_json::from_slice(&json).unwrap();
        match decoded {
            Request::Register(r) => assert_eq!(r.channel, "ticks"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn reply_variants_round_trip() {
        for reply in [
            Reply::Ok,
            Reply::Conflict,
            Reply::NotFound,
            Reply::AuthFailed,
            Reply::Error { reason: "boom".to_string() },
        ] {
            let json = serde_json::to_vec(&reply).unwrap();
            let _decoded: Reply = serde_json::from_slice(&json).unwrap();
        }
    }

    #[test]
    fn frame_round_trips_through_a_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let body = read_frame(&mut cursor).unwrap();
        assert_eq!(body, b"hello");
    }
}
