//! Handshake messages
//!
//! ClientHello:
//! ```text
//! +--------+---------+-----------+------------+------+-------+-----------+
//! | "LUNR" | Version | Bootstrap | Auth len   | Auth | Count | Indices   |
//! |  (4B)  |  (1B)   |   (1B)    | (2B, BE)   |      | (1B)  | (Count B) |
//! +--------+---------+-----------+------------+------+-------+-----------+
//! ```
//!
//! ServerReply:
//! ```text
//! +--------+---------+--------+
//! | "LUNR" | Version | Status |
//! +--------+---------+--------+
//! ```

use super::{ProtocolError, PROTOCOL_VERSION};
use crate::auth::credentials_blob;
use crate::layers::LayerIndex;
use crate::MAGIC;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

const STATUS_ACCEPTED: u8 = 0x00;
const STATUS_REJECTED: u8 = 0x01;

/// First message of a session, sent through the bootstrap layer
#[derive(Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Opaque credential blob (`login:password` for [`crate::auth::StaticAuth`])
    pub auth_data: Vec<u8>,
    /// Requested layer stack, innermost first
    pub proposed_layers: Vec<LayerIndex>,
    /// Layer the hello and the reply are encoded with
    pub bootstrap_layer: LayerIndex,
}

impl ClientHello {
    /// Build a hello carrying `login:password`
    pub fn from_credentials(
        login: &str,
        password: &str,
        proposed_layers: Vec<LayerIndex>,
        bootstrap_layer: LayerIndex,
    ) -> Self {
        Self {
            auth_data: credentials_blob(login, password),
            proposed_layers,
            bootstrap_layer,
        }
    }

    /// Login part of the credential blob, for logging
    pub fn login(&self) -> Option<&str> {
        let text = std::str::from_utf8(&self.auth_data).ok()?;
        text.split_once(crate::auth::CREDENTIAL_SEPARATOR)
            .map(|(login, _)| login)
    }

    /// Serialize
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.auth_data.len() > u16::MAX as usize {
            return Err(ProtocolError::Malformed(format!(
                "auth data too long: {} bytes",
                self.auth_data.len()
            )));
        }
        if self.proposed_layers.len() > u8::MAX as usize {
            return Err(ProtocolError::Malformed(format!(
                "too many layers: {}",
                self.proposed_layers.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(
            MAGIC.len() + 5 + self.auth_data.len() + self.proposed_layers.len(),
        );
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.bootstrap_layer);
        buf.put_u16(self.auth_data.len() as u16);
        buf.put_slice(&self.auth_data);
        buf.put_u8(self.proposed_layers.len() as u8);
        buf.put_slice(&self.proposed_layers);

        Ok(buf.to_vec())
    }

    /// Parse; trailing bytes are rejected
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        check_header(&mut buf)?;

        if buf.remaining() < 3 {
            return Err(truncated("hello"));
        }
        let bootstrap_layer = buf.get_u8();
        let auth_len = buf.get_u16() as usize;

        if buf.remaining() < auth_len + 1 {
            return Err(truncated("hello"));
        }
        let auth_data = buf[..auth_len].to_vec();
        buf.advance(auth_len);

        let count = buf.get_u8() as usize;
        if buf.remaining() != count {
            return Err(ProtocolError::Malformed(format!(
                "expected {} layer indices, found {} bytes",
                count,
                buf.remaining()
            )));
        }

        Ok(Self {
            auth_data,
            proposed_layers: buf.to_vec(),
            bootstrap_layer,
        })
    }
}

impl fmt::Debug for ClientHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHello")
            .field("login", &self.login())
            .field("proposed_layers", &self.proposed_layers)
            .field("bootstrap_layer", &self.bootstrap_layer)
            .finish()
    }
}

/// Server answer to a hello.
///
/// Every rejection cause maps to the same byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerReply {
    Accepted,
    Rejected,
}

impl ServerReply {
    /// Serialize
    pub fn encode(self) -> Vec<u8> {
        let status = match self {
            ServerReply::Accepted => STATUS_ACCEPTED,
            ServerReply::Rejected => STATUS_REJECTED,
        };

        let mut buf = Vec::with_capacity(MAGIC.len() + 2);
        buf.extend_from_slice(&MAGIC);
        buf.push(PROTOCOL_VERSION);
        buf.push(status);
        buf
    }

    /// Parse
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        check_header(&mut buf)?;

        match buf {
            [STATUS_ACCEPTED] => Ok(ServerReply::Accepted),
            [STATUS_REJECTED] => Ok(ServerReply::Rejected),
            [status] => Err(ProtocolError::Malformed(format!(
                "unknown reply status {:#04x}",
                status
            ))),
            _ => Err(ProtocolError::Malformed(format!(
                "reply has {} status bytes",
                buf.len()
            ))),
        }
    }
}

fn check_header(buf: &mut &[u8]) -> Result<(), ProtocolError> {
    if buf.remaining() < MAGIC.len() + 1 {
        return Err(truncated("header"));
    }
    if buf[..MAGIC.len()] != MAGIC {
        return Err(ProtocolError::InvalidMagic);
    }
    buf.advance(MAGIC.len());

    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }
    Ok(())
}

fn truncated(what: &str) -> ProtocolError {
    ProtocolError::Malformed(format!("truncated {}", what))
}
