use std::fmt::{Debug, Formatter};

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::transport::node_id::NodeId;
use crate::transport::wire_error::WireError;
use crate::util::safe_converter::PrecheckedCast;

/// A letter on the wire:
///
/// ```text
/// total_length : u32 LE    -- includes these 4 bytes
/// type         : u8
/// options      : u8
/// [id          : 16 bytes] -- present iff options contain UNIQUE_ID
/// part_count   : u16 LE
/// per part:
///    part_length : u32 LE
///    part_bytes
/// ```
///
/// The on-wire length is fully determined by type + options + parts, so decoding is
///  unambiguous and `try_deser_frame(to_frame())` round-trips every valid letter.
#[derive(Clone, Eq, PartialEq)]
pub struct Letter {
    pub letter_type: LetterType,
    pub options: LetterOptions,
    /// correlation id; the builders keep this and the UNIQUE_ID flag in sync
    pub id: Option<Uuid>,
    /// payload parts. For Batch each part is itself an encoded letter; for Initialize
    ///  the single part is the sender's node id
    pub parts: Vec<Bytes>,
    /// id of the peer the letter arrived from, stamped by the receiving channel after
    ///  the handshake; never serialized
    pub remote_node_id: Option<NodeId>,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum LetterType {
    Initialize,
    User,
    Batch,
    Ack,
    Heartbeat,
}

impl LetterType {
    fn wire_value(&self) -> u8 {
        match self {
            LetterType::Initialize => 1,
            LetterType::User => 2,
            LetterType::Batch => 3,
            LetterType::Ack => 4,
            LetterType::Heartbeat => 5,
        }
    }

    fn try_from_wire(value: u8) -> Result<LetterType, WireError> {
        match value {
            1 => Ok(LetterType::Initialize),
            2 => Ok(LetterType::User),
            3 => Ok(LetterType::Batch),
            4 => Ok(LetterType::Ack),
            5 => Ok(LetterType::Heartbeat),
            other => Err(WireError::malformed(format!("unknown letter type {}", other))),
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Eq, PartialEq, Debug)]
    pub struct LetterOptions: u8 {
        /// request a per-letter acknowledgement from the peer
        const ACK            = 0b0000_0001;
        /// drop without notifying the sender if undeliverable
        const SILENT_DISCARD = 0b0000_0010;
        /// the frame carries a 16-byte correlation id
        const UNIQUE_ID      = 0b0000_0100;
        /// deliver on every ready channel instead of one
        const MULTICAST      = 0b0000_1000;
    }
}

impl Letter {
    /// length prefix + type + options + part count
    pub const MIN_FRAME_LEN: usize = 8;

    pub fn user(parts: Vec<Bytes>) -> Letter {
        Letter {
            letter_type: LetterType::User,
            options: LetterOptions::empty(),
            id: None,
            parts,
            remote_node_id: None,
        }
    }

    pub fn batch(letters: &[Letter]) -> Letter {
        Letter {
            letter_type: LetterType::Batch,
            options: LetterOptions::empty(),
            id: None,
            parts: letters.iter().map(|l| l.to_frame()).collect(),
            remote_node_id: None,
        }
    }

    pub fn ack() -> Letter {
        Letter {
            letter_type: LetterType::Ack,
            options: LetterOptions::empty(),
            id: None,
            parts: Vec::new(),
            remote_node_id: None,
        }
    }

    pub fn heartbeat() -> Letter {
        Letter {
            letter_type: LetterType::Heartbeat,
            options: LetterOptions::SILENT_DISCARD,
            id: None,
            parts: Vec::new(),
            remote_node_id: None,
        }
    }

    /// the self-describing handshake letter: one part carrying the local node id
    pub fn initialize(node_id: NodeId) -> Letter {
        let mut part = BytesMut::with_capacity(NodeId::WIRE_LEN);
        node_id.ser(&mut part);
        Letter {
            letter_type: LetterType::Initialize,
            options: LetterOptions::ACK,
            id: None,
            parts: vec![part.freeze()],
            remote_node_id: None,
        }
    }

    pub fn with_ack(mut self) -> Letter {
        self.options |= LetterOptions::ACK;
        self
    }

    pub fn with_silent_discard(mut self) -> Letter {
        self.options |= LetterOptions::SILENT_DISCARD;
        self
    }

    pub fn with_multicast(mut self) -> Letter {
        self.options |= LetterOptions::MULTICAST;
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Letter {
        self.options |= LetterOptions::UNIQUE_ID;
        self.id = Some(id);
        self
    }

    pub fn requests_ack(&self) -> bool {
        self.options.contains(LetterOptions::ACK)
    }

    pub fn is_silent_discard(&self) -> bool {
        self.options.contains(LetterOptions::SILENT_DISCARD)
    }

    pub fn is_multicast(&self) -> bool {
        self.options.contains(LetterOptions::MULTICAST)
    }

    pub fn wire_len(&self) -> usize {
        let id_len = if self.options.contains(LetterOptions::UNIQUE_ID) { 16 } else { 0 };
        Self::MIN_FRAME_LEN
            + id_len
            + self.parts.iter().map(|p| size_of::<u32>() + p.len()).sum::<usize>()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let wire_len = self.wire_len();
        buf.reserve(wire_len);

        buf.put_u32_le(wire_len.prechecked_cast());
        buf.put_u8(self.letter_type.wire_value());
        buf.put_u8(self.options.bits());
        if self.options.contains(LetterOptions::UNIQUE_ID) {
            buf.put_slice(self.id.unwrap_or_else(Uuid::nil).as_bytes());
        }
        buf.put_u16_le(self.parts.len().prechecked_cast());
        for part in &self.parts {
            buf.put_u32_le(part.len().prechecked_cast());
            buf.put_slice(part);
        }
    }

    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Decode one complete frame, length prefix included. Consumes exactly
    ///  `total_length` bytes from `buf` on success.
    pub fn try_deser_frame(buf: &mut impl Buf) -> Result<Letter, WireError> {
        if buf.remaining() < 4 {
            return Err(WireError::malformed("frame shorter than its length prefix"));
        }
        let total = buf.get_u32_le() as usize;
        if total < Self::MIN_FRAME_LEN {
            return Err(WireError::malformed(format!(
                "declared frame length {} is shorter than the fixed header", total
            )));
        }
        if total - 4 > buf.remaining() {
            return Err(WireError::malformed("frame body is truncated"));
        }
        let mut body = buf.copy_to_bytes(total - 4);

        let letter_type = LetterType::try_from_wire(body.get_u8())?;
        let options = LetterOptions::from_bits_truncate(body.get_u8());

        let id = if options.contains(LetterOptions::UNIQUE_ID) {
            if body.remaining() < 16 {
                return Err(WireError::malformed("declared correlation id is truncated"));
            }
            let mut raw = [0u8; 16];
            body.copy_to_slice(&mut raw);
            Some(Uuid::from_bytes(raw))
        }
        else {
            None
        };

        let part_count = body.try_get_u16_le()
            .map_err(|_| WireError::malformed("frame ends before the part count"))? as usize;
        if part_count * size_of::<u32>() > body.remaining() {
            return Err(WireError::malformed("part count exceeds the frame body"));
        }

        let mut parts = Vec::with_capacity(part_count);
        for _ in 0..part_count {
            let part_len = body.try_get_u32_le()
                .map_err(|_| WireError::malformed("frame ends inside a part header"))? as usize;
            if part_len > body.remaining() {
                return Err(WireError::malformed("part length overruns the frame"));
            }
            parts.push(body.copy_to_bytes(part_len));
        }
        if body.has_remaining() {
            return Err(WireError::malformed("parts do not consume the frame body exactly"));
        }

        Ok(Letter {
            letter_type,
            options,
            id,
            parts,
            remote_node_id: None,
        })
    }
}

impl Debug for Letter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LTR{{{:?}", self.letter_type)?;
        if !self.options.is_empty() {
            write!(f, "+{:02x}", self.options.bits())?;
        }
        if let Some(id) = &self.id {
            write!(f, "#{}", id)?;
        }
        write!(f, ":{}p}}", self.parts.len())
    }
}
