//! In-memory representation of a binary protocol frame

use std::time::Duration;

use crate::binary::opcode::{DurabilityLevel, Magic, Opcode, Status};

/// A frame extra the codec did not recognize. Preserved rather than dropped
/// so callers can inspect what the peer sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedFrame {
    pub frame_type: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityFrame {
    pub level: DurabilityLevel,
    pub timeout: Option<Duration>,
}

/// A decoded or to-be-encoded packet.
///
/// `vbucket` is meaningful for requests, `status` for responses. The key is
/// stored without its collection prefix; `collection_id` carries it instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub magic: Magic,
    pub opcode: Opcode,
    pub datatype: u8,
    pub vbucket: u16,
    pub status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub collection_id: u32,

    pub barrier: bool,
    pub durability: Option<DurabilityFrame>,
    pub stream_id: Option<u16>,
    pub open_tracing_context: Option<Vec<u8>>,
    pub server_duration: Option<Duration>,
    pub user_impersonation: Option<Vec<u8>>,
    pub preserve_expiry: bool,
    pub read_units: Option<u16>,
    pub write_units: Option<u16>,
    pub unsupported_frames: Vec<UnsupportedFrame>,
}

impl Packet {
    pub fn request(opcode: Opcode) -> Packet {
        Packet {
            magic: Magic::ClientRequest,
            opcode,
            datatype: 0,
            vbucket: 0,
            status: 0,
            opaque: 0,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
            collection_id: 0,
            barrier: false,
            durability: None,
            stream_id: None,
            open_tracing_context: None,
            server_duration: None,
            user_impersonation: None,
            preserve_expiry: false,
            read_units: None,
            write_units: None,
            unsupported_frames: Vec::new(),
        }
    }

    pub fn response(opcode: Opcode) -> Packet {
        Packet {
            magic: Magic::ClientResponse,
            ..Packet::request(opcode)
        }
    }

    pub fn status_code(&self) -> Status {
        Status::from_u16(self.status)
    }

    pub fn is_success(&self) -> bool {
        self.magic.is_response() && self.status_code() == Status::Success
    }
}
