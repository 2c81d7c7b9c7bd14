//! Handshake wire framing.
//!
//! The hello travels over the established byte stream; the connect request
//! and response travel as rdmacm private data. Everything multi-byte is
//! big-endian on the wire.

/// Magic prefix of the client hello.
pub const MAGIC_STR: &[u8; MAGIC_LENGTH] = b"RDMA";
pub const MAGIC_LENGTH: usize = 4;

/// Length of the connection nonce.
pub const RANDOM_LENGTH: usize = 8;

/// Client hello: magic followed by the nonce.
pub const HELLO_LENGTH: usize = MAGIC_LENGTH + RANDOM_LENGTH;

/// Server reply: the big-endian socket identifier. Zero means the server
/// does not speak RDMA.
pub const SID_LENGTH: usize = 8;

/// Extra WR slots in both queues so pure ACKs always find room even when
/// data traffic saturates the negotiated window.
pub const RESERVED_WR_NUM: usize = 3;

/// Private data of the client's rdmacm connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub sid: u64,
    pub rand_str: [u8; RANDOM_LENGTH],
    pub rq_size: u32,
    pub sq_size: u32,
}

impl ConnectRequest {
    pub const LENGTH: usize = 8 + RANDOM_LENGTH + 4 + 4;

    pub fn serialize(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[..8].copy_from_slice(&self.sid.to_be_bytes());
        out[8..8 + RANDOM_LENGTH].copy_from_slice(&self.rand_str);
        out[8 + RANDOM_LENGTH..12 + RANDOM_LENGTH].copy_from_slice(&self.rq_size.to_be_bytes());
        out[12 + RANDOM_LENGTH..].copy_from_slice(&self.sq_size.to_be_bytes());
        out
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LENGTH {
            return None;
        }
        let mut rand_str = [0u8; RANDOM_LENGTH];
        rand_str.copy_from_slice(&data[8..8 + RANDOM_LENGTH]);
        Some(Self {
            sid: u64::from_be_bytes(data[..8].try_into().ok()?),
            rand_str,
            rq_size: u32::from_be_bytes(data[8 + RANDOM_LENGTH..12 + RANDOM_LENGTH].try_into().ok()?),
            sq_size: u32::from_be_bytes(data[12 + RANDOM_LENGTH..Self::LENGTH].try_into().ok()?),
        })
    }
}

/// Private data of the server's rdmacm accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub rq_size: u32,
    pub sq_size: u32,
}

impl ConnectResponse {
    pub const LENGTH: usize = 4 + 4;

    pub fn serialize(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[..4].copy_from_slice(&self.rq_size.to_be_bytes());
        out[4..].copy_from_slice(&self.sq_size.to_be_bytes());
        out
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LENGTH {
            return None;
        }
        Some(Self {
            rq_size: u32::from_be_bytes(data[..4].try_into().ok()?),
            sq_size: u32::from_be_bytes(data[4..8].try_into().ok()?),
        })
    }
}
