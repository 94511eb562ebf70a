//! Wire protocol: a 10-byte header followed by a JSON body.
//!
//! ```text
//! [ version: u8 | msg_type: u8 | msg_len: u32-LE | msg_id: u32-LE ] body…
//! ```
//!
//! `msg_type` is an ASCII letter: uppercase for client requests, lowercase
//! for server responses. Heartbeats are request-only. `msg_len` is the body
//! length in bytes; requests without parameters carry `msg_len == 0`.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::ServiceError;

/// Fixed size of the frame header.
pub const HEADER_LEN: usize = 10;

/// Only protocol version spoken so far.
pub const VERSION: u8 = 0;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MsgType {
    Hello,
    Shutdown,
    Heartbeat,
    Stats,
    Motion,
}

impl MsgType {
    fn from_request_byte(byte: u8) -> Option<Self> {
        match byte {
            b'A' => Some(MsgType::Hello),
            b'Z' => Some(MsgType::Shutdown),
            b'H' => Some(MsgType::Heartbeat),
            b'S' => Some(MsgType::Stats),
            b'M' => Some(MsgType::Motion),
            _ => None,
        }
    }

    fn response_byte(self) -> u8 {
        match self {
            MsgType::Hello => b'a',
            MsgType::Shutdown => b'z',
            MsgType::Stats => b's',
            MsgType::Motion => b'm',
            // Heartbeats have no response.
            MsgType::Heartbeat => unreachable!("heartbeats are request-only"),
        }
    }
}

/// Parsed frame header.
#[derive(Copy, Clone, Debug)]
pub struct Header {
    pub version: u8,
    pub msg_type: MsgType,
    pub msg_len: u32,
    pub msg_id: u32,
}

impl Header {
    /// Decodes a request header, rejecting unknown versions and type bytes.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self, ServiceError> {
        if raw[0] != VERSION {
            return Err(ServiceError::InvalidRequest);
        }

        let msg_type =
            MsgType::from_request_byte(raw[1]).ok_or(ServiceError::InvalidRequest)?;

        let msg_len = u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]);
        let msg_id = u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]);

        Ok(Self {
            version: raw[0],
            msg_type,
            msg_len,
            msg_id,
        })
    }
}

/// Serializes a complete response frame (header + JSON body) into `buf`,
/// replacing its previous contents.
pub fn encode_frame<T: Serialize>(
    buf: &mut Vec<u8>,
    msg_type: MsgType,
    msg_id: u32,
    body: &T,
) -> Result<(), ServiceError> {
    buf.clear();
    buf.push(VERSION);
    buf.push(msg_type.response_byte());

    let body = serde_json::to_string(body)?;
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&msg_id.to_le_bytes());
    buf.extend_from_slice(body.as_bytes());
    Ok(())
}

/// Body of a response that carries no data.
#[derive(Serialize)]
pub struct Empty {}

/// First response on a session: the server's configuration and the id the
/// session will be logged under.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    pub config: Config,
    pub session_id: String,
}

/// Subscribes to the frame-statistics feed. `update_interval` is in
/// milliseconds; 0 cancels the subscription.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsRequest {
    pub update_interval: u32,
}

/// Subscribes to the motion feed. Same interval convention as
/// [`StatsRequest`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionRequest {
    pub update_interval: u32,
}

/// Per-frame intensity statistics.
#[derive(Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub timestamp: u64,
    pub mean: f32,
    pub std_dev: f32,
    pub min: f32,
    pub max: f32,
}

/// How much the frame changed relative to the one before it.
#[derive(Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Motion {
    pub timestamp: u64,
    pub mean_abs_delta: f32,
    pub changed_fraction: f32,
}
