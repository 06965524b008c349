//! Source RCON packet framing.
//!
//! Every packet on the wire is laid out little-endian as
//!
//! ```text
//! [size:i32][id:i32][type:i32][body bytes][0x00][0x00]
//! ```
//!
//! where `size` counts everything after itself: `4 + 4 + len(body) + 2`.
//! Decoding is incremental: a buffer holding only part of a packet yields
//! `Ok(None)` and the caller keeps the bytes until more arrive.

use crate::error::{Error, Result};

/// Authenticate with the server password
pub const SERVERDATA_AUTH: i32 = 3;
/// Reply to [`SERVERDATA_AUTH`]
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
/// Run a console command. Shares its value with [`SERVERDATA_AUTH_RESPONSE`];
/// direction and protocol phase tell them apart.
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
/// Command output
pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;

/// Id the server puts in an auth response when the password is wrong
pub const AUTH_FAILED_ID: i32 = -1;

/// Largest body accepted by [`encode`]
pub const MAX_BODY_LEN: usize = 4096;

/// Bytes counted by `size` besides the body: id, type and two terminators
const SIZE_OVERHEAD: usize = 10;
/// Length of the `size` field itself
const SIZE_FIELD_LEN: usize = 4;
/// Largest `size` accepted from the wire. Some servers send bodies a little
/// over the documented limit.
const MAX_PACKET_SIZE: usize = MAX_BODY_LEN * 4 + SIZE_OVERHEAD;

/// One RCON packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconPacket {
    /// Request id chosen by the client and echoed by the server
    pub id: i32,
    /// Packet type (`SERVERDATA_*`)
    pub kind: i32,
    /// Body text
    pub body: String,
}

impl RconPacket {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    /// Authentication request
    pub fn auth(id: i32, password: impl Into<String>) -> Self {
        Self::new(id, SERVERDATA_AUTH, password)
    }

    /// Console command request
    pub fn command(id: i32, command: impl Into<String>) -> Self {
        Self::new(id, SERVERDATA_EXECCOMMAND, command)
    }

    /// Value of the `size` field for this packet
    pub fn size(&self) -> usize {
        self.body.len() + SIZE_OVERHEAD
    }

    /// Whether this is an auth response rejecting the password
    pub fn is_auth_failure(&self) -> bool {
        self.id == AUTH_FAILED_ID
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self.id, self.kind, &self.body)
    }
}

/// Serialize one packet.
///
/// Fails with [`Error::Protocol`] if `body` exceeds [`MAX_BODY_LEN`] bytes.
pub fn encode(id: i32, kind: i32, body: &str) -> Result<Vec<u8>> {
    let body = body.as_bytes();
    if body.len() > MAX_BODY_LEN {
        return Err(Error::Protocol(format!(
            "Packet body of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_BODY_LEN
        )));
    }

    let size = body.len() + SIZE_OVERHEAD;
    let mut bytes = Vec::with_capacity(SIZE_FIELD_LEN + size);
    bytes.extend_from_slice(&(size as i32).to_le_bytes());
    bytes.extend_from_slice(&id.to_le_bytes());
    bytes.extend_from_slice(&kind.to_le_bytes());
    bytes.extend_from_slice(body);
    bytes.extend_from_slice(&[0, 0]);
    Ok(bytes)
}

/// Try to decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a whole packet, or the
/// packet together with the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<Option<(RconPacket, usize)>> {
    if buf.len() < SIZE_FIELD_LEN {
        return Ok(None);
    }

    let size = read_i32(buf, 0);
    if size < SIZE_OVERHEAD as i32 || size as usize > MAX_PACKET_SIZE {
        return Err(Error::Protocol(format!("Invalid packet size {}", size)));
    }

    let size = size as usize;
    let total = SIZE_FIELD_LEN + size;
    if buf.len() < total {
        return Ok(None);
    }

    let id = read_i32(buf, 4);
    let kind = read_i32(buf, 8);
    let body_end = total - 2;
    if buf[body_end] != 0 || buf[body_end + 1] != 0 {
        return Err(Error::Protocol(format!(
            "Packet {} is missing its null terminators",
            id
        )));
    }

    let body = String::from_utf8_lossy(&buf[12..body_end]).into_owned();
    Ok(Some((RconPacket { id, kind, body }, total)))
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Receive buffer that reassembles packets from arbitrary TCP chunks.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: Vec<u8>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the socket.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Remove and return the next complete packet, if any.
    ///
    /// An error means the stream is corrupt; the buffer should be discarded
    /// along with the connection.
    pub fn next_packet(&mut self) -> Result<Option<RconPacket>> {
        match decode(&self.buf)? {
            Some((packet, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Bytes held back waiting for the rest of a packet
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let bytes = encode(7, SERVERDATA_AUTH, "pw").unwrap();
        assert_eq!(
            bytes,
            vec![12, 0, 0, 0, 7, 0, 0, 0, 3, 0, 0, 0, b'p', b'w', 0, 0]
        );
    }

    #[test]
    fn test_decode_returns_what_was_encoded() {
        let longest = "x".repeat(MAX_BODY_LEN);
        for body in ["", "save", longest.as_str()] {
            let bytes = encode(42, SERVERDATA_RESPONSE_VALUE, body).unwrap();
            let (packet, consumed) = decode(&bytes).unwrap().unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(packet, RconPacket::new(42, SERVERDATA_RESPONSE_VALUE, body));
        }
    }

    #[test]
    fn test_body_over_limit_rejected() {
        let body = "x".repeat(MAX_BODY_LEN + 1);
        assert!(matches!(encode(1, SERVERDATA_EXECCOMMAND, &body), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_partial_packet_is_incomplete() {
        let bytes = encode(1, SERVERDATA_RESPONSE_VALUE, "players").unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(decode(&bytes[..cut]).unwrap(), None, "cut at {}", cut);
        }
    }

    #[test]
    fn test_fragmented_packet_needs_both_chunks() {
        // 20 bytes on the wire: 4 size + 4 id + 4 type + 6 body + 2 nulls
        let bytes = encode(5, SERVERDATA_RESPONSE_VALUE, "status").unwrap();
        assert_eq!(bytes.len(), 20);

        let mut buffer = PacketBuffer::new();
        buffer.extend(&bytes[..3]);
        assert_eq!(buffer.next_packet().unwrap(), None);
        assert_eq!(buffer.len(), 3);

        buffer.extend(&bytes[3..]);
        let packet = buffer.next_packet().unwrap().unwrap();
        assert_eq!(packet.id, 5);
        assert_eq!(packet.body, "status");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_yields_back_to_back_packets_and_keeps_tail() {
        let mut stream = encode(1, SERVERDATA_RESPONSE_VALUE, "one").unwrap();
        stream.extend(encode(2, SERVERDATA_RESPONSE_VALUE, "two").unwrap());
        let third = encode(3, SERVERDATA_RESPONSE_VALUE, "three").unwrap();
        stream.extend(&third[..5]);

        let mut buffer = PacketBuffer::new();
        buffer.extend(&stream);
        assert_eq!(buffer.next_packet().unwrap().unwrap().body, "one");
        assert_eq!(buffer.next_packet().unwrap().unwrap().body, "two");
        assert_eq!(buffer.next_packet().unwrap(), None);
        assert_eq!(buffer.len(), 5);

        buffer.extend(&third[5..]);
        assert_eq!(buffer.next_packet().unwrap().unwrap().body, "three");
    }

    #[test]
    fn test_invalid_size_is_protocol_error() {
        let bytes = [3, 0, 0, 0, 1, 0, 0, 0];
        assert!(matches!(decode(&bytes), Err(Error::Protocol(_))));

        let huge = (i32::MAX).to_le_bytes();
        assert!(matches!(decode(&huge), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_missing_terminator_is_protocol_error() {
        let mut bytes = encode(9, SERVERDATA_RESPONSE_VALUE, "ok").unwrap();
        let last = bytes.len() - 1;
        bytes[last] = b'!';
        assert!(matches!(decode(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_auth_failure_id() {
        let packet = RconPacket::new(AUTH_FAILED_ID, SERVERDATA_AUTH_RESPONSE, "");
        assert!(packet.is_auth_failure());
        assert!(!RconPacket::auth(7, "pw").is_auth_failure());
    }
}
