//! Base-packet codec for the upstream link.
//!
//! Every frame on the link is a delimiter-terminated envelope. Between
//! delimiters one of two shapes appears: a base packet (32-byte big-endian
//! header followed by `data_sum_length` payload bytes), or a heartbeat (a
//! fixed six-byte marker followed by the fixed eight-byte separator). The
//! codec is pure; it never touches a socket or a clock.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::AuthConfig;
use crate::error::Error;

/// Base-packet header size on the wire.
pub const HEADER_LEN: usize = 32;

/// Token field size in an authentication packet.
pub const TOKEN_LEN: usize = 32;

/// UTF-8 marker carried by heartbeat packets.
pub const HEARTBEAT_MARKER: [u8; 6] = [0xE5, 0xBF, 0x83, 0xE8, 0xB7, 0xB3];

/// Fixed separator literal appended to heartbeat packets.
pub const SEPARATOR: [u8; 8] = [0x78, 0x78, 0x78, 0x78, 0x88, 0x88, 0x88, 0x88];

/// Data-segment length declared by authentication packets.
const AUTH_DATA_SUM_LENGTH: u32 = 0x28;

/// A decoded (or to-be-encoded) base packet.
///
/// Header fields other than `data_sum_length` are not interpreted by the
/// bridge; they are carried through for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasePacket {
    pub source_info: u32,
    pub host_info: u32,
    pub package_no: u64,
    pub current_data_item: u16,
    pub data_sum_length: u32,
    pub retransmission_flag: u16,
    pub retransmission_data: u16,
    pub retransmission_sum_length: u32,
    pub payload: Bytes,
}

impl BasePacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.source_info);
        buf.put_u32(self.host_info);
        buf.put_u64(self.package_no);
        buf.put_u16(self.current_data_item);
        buf.put_u32(self.data_sum_length);
        buf.put_u16(self.retransmission_flag);
        buf.put_u16(self.retransmission_data);
        buf.put_u32(self.retransmission_sum_length);
        // Reserved tail of the 32-byte header.
        buf.put_u16(0);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Decodes a complete base packet.
///
/// The declared `data_sum_length` is the authoritative framing signal: the
/// input must be exactly `HEADER_LEN + data_sum_length` bytes.
pub fn decode_base_packet(frame: &[u8]) -> Result<BasePacket, Error> {
    if frame.len() < HEADER_LEN {
        return Err(Error::DecodeShort { have: frame.len() });
    }

    let mut header = &frame[..HEADER_LEN];
    let source_info = header.get_u32();
    let host_info = header.get_u32();
    let package_no = header.get_u64();
    let current_data_item = header.get_u16();
    let data_sum_length = header.get_u32();
    let retransmission_flag = header.get_u16();
    let retransmission_data = header.get_u16();
    let retransmission_sum_length = header.get_u32();

    let declared = data_sum_length as usize;
    let actual = frame.len() - HEADER_LEN;
    if actual < declared {
        return Err(Error::DecodeShort { have: frame.len() });
    }
    if actual > declared {
        return Err(Error::DecodeMalformed { declared, actual });
    }

    Ok(BasePacket {
        source_info,
        host_info,
        package_no,
        current_data_item,
        data_sum_length,
        retransmission_flag,
        retransmission_data,
        retransmission_sum_length,
        payload: Bytes::copy_from_slice(&frame[HEADER_LEN..]),
    })
}

/// Returns the fixed heartbeat frame: marker followed by separator.
pub fn encode_heartbeat() -> Bytes {
    let mut buf = BytesMut::with_capacity(HEARTBEAT_MARKER.len() + SEPARATOR.len());
    buf.put_slice(&HEARTBEAT_MARKER);
    buf.put_slice(&SEPARATOR);
    buf.freeze()
}

/// Builds authentication packets.
///
/// `package_no` is process-local and monotone: it starts at 1 and is bumped
/// on every emission, across reconnects.
pub struct AuthEncoder {
    source_id: u32,
    host_id: u32,
    token: String,
    package_no: u64,
}

impl AuthEncoder {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            source_id: config.source_id,
            host_id: config.host_id,
            token: config.token.clone(),
            package_no: 1,
        }
    }

    /// Encodes the next authentication packet and advances the sequence.
    pub fn encode_auth(&mut self) -> Bytes {
        let packet = BasePacket {
            source_info: self.source_id,
            host_info: self.host_id,
            package_no: self.package_no,
            current_data_item: 1,
            data_sum_length: AUTH_DATA_SUM_LENGTH,
            retransmission_flag: 0,
            retransmission_data: 0,
            retransmission_sum_length: 0,
            payload: Bytes::copy_from_slice(&self.token_bytes()),
        };

        self.package_no += 1;
        packet.encode()
    }

    /// Derives the 32 token bytes from the configured token string.
    ///
    /// A 64-character hex token decodes to its 32 raw bytes; any other
    /// non-empty token is taken as ASCII, zero-padded to 32 bytes and
    /// truncated beyond; an empty token yields 32 random bytes.
    fn token_bytes(&self) -> [u8; TOKEN_LEN] {
        let mut out = [0u8; TOKEN_LEN];

        if self.token.is_empty() {
            rand::Rng::fill(&mut rand::thread_rng(), &mut out[..]);
            return out;
        }

        if self.token.len() == 2 * TOKEN_LEN {
            if let Ok(decoded) = hex::decode(&self.token) {
                out.copy_from_slice(&decoded);
                return out;
            }
        }

        let ascii = self.token.as_bytes();
        let n = ascii.len().min(TOKEN_LEN);
        out[..n].copy_from_slice(&ascii[..n]);
        out
    }

    pub fn package_no(&self) -> u64 {
        self.package_no
    }
}
