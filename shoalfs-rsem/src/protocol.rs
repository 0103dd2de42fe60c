// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The rsem wire protocol.
//!
//! Every exchange starts with a 4-byte big-endian type code. Messages that
//! carry a body follow it with a 4-byte big-endian byte count and that many
//! bytes of UTF-8 JSON. The numeric codes are arbitrary but fixed across a
//! deployment; a server and its clients must be built from the same table.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Upper bound on a JSON body. Anything larger is a protocol violation,
/// not a semaphore name.
pub const MAX_BODY_BYTES: u32 = 1 << 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum MessageType {
    /// Client acknowledges a grant callback.
    ClientAck = 0,
    /// Release a semaphore; body is [`SemRelease`].
    ClientRelSem = 1,
    /// Take a semaphore; body is [`SemRequest`].
    ClientReqSem = 2,
    /// Release accepted.
    ServerAck = 3,
    /// No-delay take failed.
    ServerNack = 4,
    /// Take queued; the server will dial back.
    ServerDelaySem = 5,
    /// Semaphore granted. On a callback it carries a [`SemGrant`] body.
    ServerGiveSem = 6,
    ServerInternalError = 7,
    ServerNoSuchSem = 8,
}

impl MessageType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::ClientAck),
            1 => Some(Self::ClientRelSem),
            2 => Some(Self::ClientReqSem),
            3 => Some(Self::ServerAck),
            4 => Some(Self::ServerNack),
            5 => Some(Self::ServerDelaySem),
            6 => Some(Self::ServerGiveSem),
            7 => Some(Self::ServerInternalError),
            8 => Some(Self::ServerNoSuchSem),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message type code {0}")]
    UnknownType(u32),
    #[error("message body of {0} bytes exceeds the {MAX_BODY_BYTES}-byte cap")]
    OversizedBody(u32),
    #[error("malformed JSON body: {0}")]
    BadBody(#[from] serde_json::Error),
}

/// A take request. `port` is where the client will listen for a delayed
/// grant; 0 means "fail instead of queueing me".
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SemRequest {
    pub name: String,
    pub port: u16,
}

/// A release.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SemRelease {
    pub name: String,
}

/// The body of a grant callback, naming the semaphore being granted so the
/// client can detect a crossed wire.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SemGrant {
    pub name: String,
}

pub fn write_message_type(w: &mut impl Write, ty: MessageType) -> std::io::Result<()> {
    w.write_all(&(ty as u32).to_be_bytes())
}

pub fn read_message_type(r: &mut impl Read) -> Result<MessageType, ProtocolError> {
    let mut code = [0u8; 4];
    r.read_exact(&mut code)?;
    let code = u32::from_be_bytes(code);
    MessageType::from_u32(code).ok_or(ProtocolError::UnknownType(code))
}

/// Writes the length-prefixed JSON body of a message.
pub fn write_json_body<T: Serialize>(w: &mut impl Write, body: &T) -> Result<(), ProtocolError> {
    let text = serde_json::to_vec(body)?;
    w.write_all(&(text.len() as u32).to_be_bytes())?;
    w.write_all(&text)?;
    Ok(())
}

/// Reads a length-prefixed JSON body, enforcing the size cap before any
/// allocation happens on the peer's say-so.
pub fn read_json_body<T: DeserializeOwned>(r: &mut impl Read) -> Result<T, ProtocolError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len);
    if len > MAX_BODY_BYTES {
        return Err(ProtocolError::OversizedBody(len));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
