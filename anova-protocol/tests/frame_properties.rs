//! Property tests for the frame codec's round-trip and checksum invariants.

use anova_protocol::{decode, encode};
use proptest::prelude::*;

proptest! {
    #[test]
    fn encode_then_decode_is_identity(s in "[ -~]{1,200}") {
        // Printable ASCII only, no CR, since encode() treats a trailing CR
        // as already-present framing rather than payload content.
        prop_assume!(!s.contains('\r'));
        let framed = encode(&s);
        let decoded = decode(&framed).unwrap();
        prop_assert_eq!(decoded, s);
    }

    #[test]
    fn decoded_length_byte_matches_payload(s in "[ -~]{1,200}") {
        prop_assume!(!s.contains('\r'));
        let framed = encode(&s);
        let claimed_len = framed[1] as usize;
        assert_eq!(claimed_len, framed.len() - 4); // header + len + checksum + syn
    }

    #[test]
    fn single_bit_flip_in_payload_is_detected(s in "[ -~]{2,200}", idx in 0usize..200) {
        prop_assume!(!s.contains('\r'));
        let mut framed = encode(&s);
        let payload_len = framed[1] as usize;
        if payload_len == 0 {
            return Ok(());
        }
        let flip_at = 2 + (idx % payload_len);
        framed[flip_at] ^= 0x01;
        // A single-bit flip in the payload should either change the decoded
        // text or be caught by the checksum -- never both, silently.
        match decode(&framed) {
            Ok(text) => prop_assert_ne!(text, s),
            Err(_) => {}
        }
    }
}
