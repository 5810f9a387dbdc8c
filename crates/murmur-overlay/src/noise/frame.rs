//! Outer wire framing for the noise swarm.
//!
//! Every lower-swarm datagram carries: `u8 kind || u32_be nonce || body`.
//! The kind tells the receiver which of its sessions the frame belongs to:
//! frames originated by a connection's initiator land in our responder
//! session, and vice versa. For data frames the nonce is the sender's AEAD
//! counter; for handshake frames it is zero.

use murmur_swarm::SwarmError;

/// Fixed outer header size: kind byte plus nonce.
pub(crate) const FRAME_HEADER: usize = 5;

/// Discriminates frame direction and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Encrypted data from the connection's initiator
    DataInit = 0x00,
    /// Encrypted data from the connection's responder
    DataResp = 0x01,
    /// Handshake hello from the initiator
    HelloInit = 0x02,
    /// Handshake hello from the responder
    HelloResp = 0x03,
}

impl FrameKind {
    fn from_u8(x: u8) -> Option<Self> {
        match x {
            0x00 => Some(FrameKind::DataInit),
            0x01 => Some(FrameKind::DataResp),
            0x02 => Some(FrameKind::HelloInit),
            0x03 => Some(FrameKind::HelloResp),
            _ => None,
        }
    }

    /// True if the frame was produced by the connection's initiator.
    pub(crate) fn from_initiator(self) -> bool {
        matches!(self, FrameKind::DataInit | FrameKind::HelloInit)
    }
}

/// A parsed outer frame, borrowing the body from the datagram.
#[derive(Debug)]
pub(crate) struct Frame<'a> {
    pub kind: FrameKind,
    pub nonce: u32,
    pub body: &'a [u8],
}

pub(crate) fn make_frame(kind: FrameKind, nonce: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER + body.len());
    frame.push(kind as u8);
    frame.extend_from_slice(&nonce.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

pub(crate) fn parse_frame(x: &[u8]) -> Result<Frame<'_>, SwarmError> {
    if x.len() < FRAME_HEADER {
        return Err(SwarmError::Transport("short noise frame".into()));
    }
    let kind = FrameKind::from_u8(x[0])
        .ok_or_else(|| SwarmError::Transport(format!("unknown noise frame kind {:#04x}", x[0])))?;
    let nonce = u32::from_be_bytes([x[1], x[2], x[3], x[4]]);
    Ok(Frame {
        kind,
        nonce,
        body: &x[FRAME_HEADER..],
    })
}
