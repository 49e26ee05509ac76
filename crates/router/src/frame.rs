//! Wire-frame header intake.
//!
//! The hybrid-communication peers prefix every payload with a fixed
//! 113-byte header. This module only validates and strips it; building
//! frames belongs to the peer-side serializer. The checksum is a plain
//! byte sum, a framing sanity check rather than an integrity guarantee.

use std::fmt;

use thiserror::Error;

/// `"EDGE"` interpreted as a little-endian `u32`.
pub const FRAME_MAGIC: u32 = u32::from_le_bytes(*b"EDGE");
/// Lowest header version this node understands.
pub const FRAME_VERSION_MIN: u32 = 1;
/// Header length on the wire, all fields packed little-endian.
pub const HEADER_LEN: usize = 113;
/// Default cap on payload length.
pub const DEFAULT_MAX_PAYLOAD: u32 = 4 * 1024 * 1024;

const ID_LEN: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated header: {0} of {HEADER_LEN} bytes")]
    Truncated(usize),

    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("payload length {len} exceeds cap {max}")]
    OversizedPayload { len: u32, max: u32 },

    #[error("checksum mismatch: header says {expected:#010x}, payload sums to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// A parsed and partially validated frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u32,
    pub kind: u32,
    pub priority: u8,
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub payload_len: u32,
    pub checksum: u32,
    pub sender: String,
    pub receiver: String,
    pub flags: u32,
}

impl FrameHeader {
    /// Parse a header from the front of `buf`, checking magic, version
    /// and the payload cap. The payload itself is validated separately
    /// by [`FrameHeader::validate_payload`].
    pub fn parse(buf: &[u8], max_payload: u32) -> Result<FrameHeader, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated(buf.len()));
        }
        let mut cursor = Cursor { buf, pos: 0 };

        let magic = cursor.u32();
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let version = cursor.u32();
        if version < FRAME_VERSION_MIN {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let kind = cursor.u32();
        let priority = cursor.u8();
        let sequence = cursor.u32();
        let timestamp_ms = cursor.u64();
        let payload_len = cursor.u32();
        if payload_len > max_payload {
            return Err(FrameError::OversizedPayload {
                len: payload_len,
                max: max_payload,
            });
        }
        let checksum = cursor.u32();
        let sender = cursor.id();
        let receiver = cursor.id();
        let flags = cursor.u32();
        cursor.skip(12); // reserved
        debug_assert_eq!(cursor.pos, HEADER_LEN);

        Ok(FrameHeader {
            version,
            kind,
            priority,
            sequence,
            timestamp_ms,
            payload_len,
            checksum,
            sender,
            receiver,
            flags,
        })
    }

    /// Check the payload against the header's length and checksum.
    pub fn validate_payload(&self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() != self.payload_len as usize {
            return Err(FrameError::Truncated(payload.len()));
        }
        let actual = checksum(payload);
        if actual != self.checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Serialize the header. Provided for peers and tests; the node
    /// itself only parses.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut w = Writer { buf: &mut out, pos: 0 };
        w.u32(FRAME_MAGIC);
        w.u32(self.version);
        w.u32(self.kind);
        w.u8(self.priority);
        w.u32(self.sequence);
        w.u64(self.timestamp_ms);
        w.u32(self.payload_len);
        w.u32(self.checksum);
        w.id(&self.sender);
        w.id(&self.receiver);
        w.u32(self.flags);
        out
    }

    /// A header describing `payload`, ready to serialize.
    pub fn for_payload(sender: &str, receiver: &str, kind: u32, payload: &[u8]) -> FrameHeader {
        FrameHeader {
            version: FRAME_VERSION_MIN,
            kind,
            priority: 0,
            sequence: 0,
            timestamp_ms: 0,
            payload_len: payload.len() as u32,
            checksum: checksum(payload),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            flags: 0,
        }
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame v{} kind {} seq {} from `{}` to `{}` ({} bytes)",
            self.version, self.kind, self.sequence, self.sender, self.receiver, self.payload_len
        )
    }
}

/// Byte sum modulo 2^32.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_add(*b as u32))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(
            self.buf[self.pos..self.pos + 4]
                .try_into()
                .expect("fixed-width read"),
        );
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = u64::from_le_bytes(
            self.buf[self.pos..self.pos + 8]
                .try_into()
                .expect("fixed-width read"),
        );
        self.pos += 8;
        v
    }

    /// A 32-byte zero-padded ASCII identifier.
    fn id(&mut self) -> String {
        let raw = &self.buf[self.pos..self.pos + ID_LEN];
        self.pos += ID_LEN;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(ID_LEN);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    fn id(&mut self, s: &str) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(ID_LEN);
        self.buf[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
        self.pos += ID_LEN;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: &[u8]) -> Vec<u8> {
        let header = FrameHeader::for_payload("edge-node-7", "inference", 3, payload);
        let mut frame = header.to_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn parse_accepts_a_well_formed_frame() {
        let payload = b"prompt: hello";
        let frame = sample(payload);

        let header = FrameHeader::parse(&frame, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.kind, 3);
        assert_eq!(header.sender, "edge-node-7");
        assert_eq!(header.receiver, "inference");
        assert_eq!(header.payload_len as usize, payload.len());
        header.validate_payload(payload).unwrap();
    }

    #[test]
    fn truncation_magic_and_version_are_rejected() {
        let frame = sample(b"x");

        assert_eq!(
            FrameHeader::parse(&frame[..10], DEFAULT_MAX_PAYLOAD),
            Err(FrameError::Truncated(10))
        );

        let mut bad_magic = frame.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(
            FrameHeader::parse(&bad_magic, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::BadMagic(_))
        ));

        let mut bad_version = frame;
        bad_version[4..8].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            FrameHeader::parse(&bad_version, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::UnsupportedVersion(0))
        );
    }

    #[test]
    fn payload_cap_is_enforced() {
        let frame = sample(&[0u8; 64]);
        assert_eq!(
            FrameHeader::parse(&frame, 16),
            Err(FrameError::OversizedPayload { len: 64, max: 16 })
        );
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        let payload = b"tensor bytes";
        let frame = sample(payload);
        let header = FrameHeader::parse(&frame, DEFAULT_MAX_PAYLOAD).unwrap();

        let mut corrupted = payload.to_vec();
        corrupted[0] = corrupted[0].wrapping_add(1);
        assert!(matches!(
            header.validate_payload(&corrupted),
            Err(FrameError::ChecksumMismatch { .. })
        ));

        // Length mismatch is reported before the sum.
        assert_eq!(
            header.validate_payload(&payload[..4]),
            Err(FrameError::Truncated(4))
        );
    }

    #[test]
    fn long_ids_are_clipped_to_the_field() {
        let long = "x".repeat(40);
        let header = FrameHeader::for_payload(&long, "r", 0, b"");
        let bytes = header.to_bytes();
        let parsed = FrameHeader::parse(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(parsed.sender, "x".repeat(32));
    }
}
