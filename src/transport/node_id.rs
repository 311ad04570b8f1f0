use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::transport::wire_error::WireError;

/// 128-bit identifier of a process participating in the transport. Peers learn each
///  other's id from the single part of an Initialize letter, so the 16-byte wire form
///  must round-trip exactly.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(Uuid);

impl NodeId {
    pub const WIRE_LEN: usize = 16;

    /// a fresh id for this process
    pub fn random() -> NodeId {
        NodeId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> NodeId {
        NodeId(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<NodeId, WireError> {
        if buf.remaining() < Self::WIRE_LEN {
            return Err(WireError::malformed("node id requires 16 bytes"));
        }
        let mut raw = [0u8; Self::WIRE_LEN];
        buf.copy_to_slice(&mut raw);
        Ok(NodeId(Uuid::from_bytes(raw)))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_node_id_ser_round_trip() {
        let id = NodeId::random();
        let mut buf = bytes::BytesMut::new();
        id.ser(&mut buf);
        assert_eq!(buf.len(), NodeId::WIRE_LEN);

        let deser = NodeId::try_deser(&mut buf.freeze()).unwrap();
        assert_eq!(id, deser);
    }

    #[test]
    fn test_node_id_deser_too_short() {
        let mut buf: &[u8] = &[0u8; 15];
        assert!(NodeId::try_deser(&mut buf).is_err());
    }
}
