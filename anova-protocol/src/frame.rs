//! On-wire frame codec: header byte, length, rotate-obfuscated payload,
//! checksum, optional trailing SYN.
//!
//! Wire layout for a message body of length `L` (1 <= L <= 255):
//!
//! ```text
//! offset 0          : 0x68 ('h')
//! offset 1          : L
//! offset 2..2+L-1   : obfuscated payload bytes
//! offset 2+L        : checksum byte
//! (optional)        : trailing 0x16 (SYN)
//! ```

use tracing::warn;

use crate::error::ProtocolError;

/// Frame header byte ('h')
pub const HEADER: u8 = 0x68;
/// Frame terminator the encoder appends
pub const SYN: u8 = 0x16;

/// Rotate `byte` left by `n` bits within a byte.
fn roll_shift(byte: u8, n: u32) -> u8 {
    if n == 0 {
        return byte;
    }
    byte.rotate_left(n)
}

/// Inverse of [`roll_shift`].
fn reverse_roll_shift(byte: u8, n: u32) -> u8 {
    if n == 0 {
        return byte;
    }
    byte.rotate_right(n)
}

/// Encode a textual command into a framed, obfuscated wire message.
///
/// Appends a trailing CR to `message` if it is not already present, and a
/// trailing SYN after the checksum.
pub fn encode(message: &str) -> Vec<u8> {
    let mut text = message.to_string();
    if !text.ends_with('\r') {
        text.push('\r');
    }
    let bytes = text.as_bytes();
    let len = bytes.len();
    debug_assert!(len >= 1 && len <= 255, "payload length out of range");

    let mut out = Vec::with_capacity(3 + len);
    out.push(HEADER);
    out.push(len as u8);

    let mut checksum: u32 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        let n = ((i + 1) % 7) as u32;
        let obfuscated = roll_shift(byte, n);
        out.push(obfuscated);
        checksum += obfuscated as u32;
    }
    out.push((checksum & 0xFF) as u8);
    out.push(SYN);
    out
}

/// Result of decoding a single frame out of a byte buffer: the decoded text
/// and the number of bytes of `data` consumed.
pub struct Decoded {
    pub text: String,
    pub consumed: usize,
}

/// Decode exactly one frame from the front of `data`.
///
/// `data` may or may not include a trailing SYN byte for this frame; if
/// present it is counted as consumed. Returns [`ProtocolError::Incomplete`]
/// if `data` does not yet contain a full frame (caller should buffer more
/// bytes and retry).
pub fn decode_one(data: &[u8]) -> Result<Decoded, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::Incomplete { needed: 1, have: 0 });
    }
    if data[0] != HEADER {
        return Err(ProtocolError::InvalidHeader(data[0]));
    }
    if data.len() < 2 {
        return Err(ProtocolError::Incomplete { needed: 2, have: data.len() });
    }

    let len = data[1] as usize;
    // header + length + payload(len) + checksum(1)
    let frame_len = 2 + len + 1;
    if data.len() < frame_len {
        return Err(ProtocolError::Incomplete {
            needed: frame_len,
            have: data.len(),
        });
    }

    let payload = &data[2..2 + len];
    let checksum_byte = data[2 + len];

    let mut calculated: u32 = 0;
    let mut chars = Vec::with_capacity(len);
    for (i, &byte) in payload.iter().enumerate() {
        calculated += byte as u32;
        let n = ((i + 1) % 7) as u32;
        chars.push(reverse_roll_shift(byte, n));
    }

    if checksum_byte != (calculated & 0xFF) as u8 {
        return Err(ProtocolError::ChecksumMismatch {
            expected: checksum_byte,
            actual: (calculated & 0xFF) as u8,
        });
    }

    let mut text = String::from_utf8(chars).map_err(|_| ProtocolError::InvalidUtf8)?;
    if text.ends_with('\r') {
        text.pop();
    }

    // A trailing SYN immediately after the checksum belongs to this frame.
    let mut consumed = frame_len;
    if data.len() > frame_len && data[frame_len] == SYN {
        consumed += 1;
    }

    Ok(Decoded { text, consumed })
}

/// Decode a full buffer that is known to contain exactly one frame (with or
/// without trailing SYN), for callers that already split the stream into
/// discrete frames.
pub fn decode(data: &[u8]) -> Result<String, ProtocolError> {
    // Tolerate a trailing SYN even though decode_one already does; this
    // mirrors the Python reference which strips SYN up front.
    let trimmed = if data.last() == Some(&SYN) {
        &data[..data.len() - 1]
    } else {
        data
    };
    decode_one(trimmed).map(|d| d.text)
}

/// Incrementally decodes a byte stream into frames, buffering partial reads.
///
/// Mirrors the Connection's need to treat the TCP stream as a sequence of
/// frames that may arrive split across multiple `read()` calls, or with
/// several frames coalesced into one `read()` call.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-read bytes and drain as many complete frames as are
    /// available. Returns decoded message texts in arrival order; a
    /// malformed frame is reported as an `Err` and decoding resumes at the
    /// byte following the bad frame's header so one corrupt frame does not
    /// wedge the stream forever.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, ProtocolError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            if self.buf.is_empty() {
                break;
            }
            match decode_one(&self.buf) {
                Ok(Decoded { text, consumed }) => {
                    self.buf.drain(..consumed);
                    out.push(Ok(text));
                }
                Err(ProtocolError::Incomplete { .. }) => break,
                Err(e @ ProtocolError::InvalidHeader(_)) => {
                    // Resynchronize by dropping the offending byte.
                    warn!(byte = format!("0x{:02x}", self.buf[0]), "resynchronizing after invalid frame header");
                    self.buf.remove(0);
                    out.push(Err(e));
                }
                Err(e @ ProtocolError::ChecksumMismatch { .. }) => {
                    // We know the claimed frame length even though the
                    // checksum is wrong; drop exactly that many bytes so we
                    // don't reinterpret payload bytes as a new header.
                    let len = self.buf[1] as usize;
                    let frame_len = (2 + len + 1).min(self.buf.len());
                    warn!(%e, frame_len, "dropping frame with bad checksum");
                    self.buf.drain(..frame_len);
                    out.push(Err(e));
                }
                Err(e) => {
                    self.buf.clear();
                    out.push(Err(e));
                    break;
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_get_id_card() {
        let encoded = encode("get id card");
        assert_eq!(encoded[0], HEADER);
        assert_eq!(encoded[1], 0x0c); // 11 chars + CR = 12 = 0x0c
        assert_eq!(*encoded.last().unwrap(), SYN);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, "get id card");
    }

    #[test]
    fn appends_cr_when_missing() {
        let a = encode("status");
        let b = encode("status\r");
        assert_eq!(a, b);
    }

    #[test]
    fn decode_tolerates_missing_syn() {
        let mut encoded = encode("status");
        encoded.pop(); // drop trailing SYN
        assert_eq!(decode(&encoded).unwrap(), "status");
    }

    #[test]
    fn checksum_offset_matches_payload_length_plus_cr() {
        let encoded = encode("stop");
        assert_eq!(encoded[1] as usize, "stop\r".len());
        let header_len = encoded[1] as usize;
        let payload = &encoded[2..2 + header_len];
        let checksum = encoded[2 + header_len];
        let sum: u32 = payload.iter().map(|&b| b as u32).sum();
        assert_eq!(checksum, (sum & 0xFF) as u8);
    }

    #[test]
    fn flipping_a_payload_byte_breaks_checksum() {
        let mut encoded = encode("read temp");
        encoded[2] ^= 0xFF;
        let err = decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::ChecksumMismatch { .. }));
    }

    #[test]
    fn rejects_bad_header() {
        let mut encoded = encode("start");
        encoded[0] = 0x00;
        let err = decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeader(0)));
    }

    #[test]
    fn decoder_buffers_partial_frames() {
        let encoded = encode("read timer");
        let mut decoder = FrameDecoder::new();
        let (head, tail) = encoded.split_at(3);
        assert!(decoder.push(head).is_empty());
        let results = decoder.push(tail);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), "read timer");
    }

    #[test]
    fn decoder_splits_coalesced_frames() {
        let mut encoded = encode("status");
        encoded.extend(encode("read temp"));
        let mut decoder = FrameDecoder::new();
        let results = decoder.push(&encoded);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), "status");
        assert_eq!(results[1].as_ref().unwrap(), "read temp");
    }

    #[test]
    fn every_command_roundtrips_through_encode_decode() {
        for cmd in [
            "get id card",
            "version",
            "get number",
            "status",
            "read temp",
            "read set temp",
            "set temp 57.5",
            "read unit",
            "set unit c",
            "start",
            "stop",
            "start time",
            "stop time",
            "read timer",
            "set timer 30",
            "clear alarm",
            "speaker status",
        ] {
            let encoded = encode(cmd);
            assert_eq!(decode(&encoded).unwrap(), cmd);
        }
    }
}
