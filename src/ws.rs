//! WebSocket frame codec and handshake (RFC 6455, server side).
//!
//! Grounded on the same shape the `fastwebsockets` frame parser uses (a
//! minimal, allocation-light reader over a byte slice distinguishing
//! "need more bytes" from "got a frame") and on the handshake computation
//! used throughout the pack's axum/salvo WS extractors
//! (`Sha1::update(key).update(GUID)` → base64). Both are reimplemented here
//! rather than pulled in as a dependency because frame parsing is named as
//! part of the core in spec.md §2 ("the frame codecs are included as part
//! of the core").
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::text::Text;

/// The GUID RFC 6455 says to append to the client's key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            _ => return None,
        })
    }

    fn to_byte(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// The outcome of attempting to parse one frame out of a read buffer.
pub enum Decoded {
    /// Not enough bytes yet; the caller should keep reading.
    Incomplete,
    /// A frame was invalid per spec.md §4.5 (fragmented frame, bad opcode).
    Invalid(&'static str),
    /// A complete, unmasked-in-place frame, plus how many bytes of the
    /// input buffer it consumed.
    Frame { opcode: OpCode, payload: Vec<u8>, consumed: usize },
}

/// Computes the length of a complete client frame at the start of `buf`,
/// returning `0` if the buffer doesn't yet hold a full frame — the spec's
/// `ws_calc_len`.
pub fn frame_len(buf: &[u8]) -> usize {
    if buf.len() < 2 {
        return 0;
    }
    let masked = buf[1] & 0x80 != 0;
    let len7 = (buf[1] & 0x7F) as usize;
    let mut pos = 2usize;
    let payload_len = match len7 {
        126 => {
            if buf.len() < pos + 2 {
                return 0;
            }
            let n = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
            pos += 2;
            n
        }
        127 => {
            if buf.len() < pos + 8 {
                return 0;
            }
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&buf[pos..pos + 8]);
            pos += 8;
            u64::from_be_bytes(arr) as usize
        }
        n => n,
    };
    if masked {
        pos += 4;
    }
    let total = pos + payload_len;
    if buf.len() < total {
        0
    } else {
        total
    }
}

/// Parses one client frame from the start of `buf`.
///
/// Continuation frames (and any frame with `FIN` unset) are rejected per
/// spec.md §4.5: "Continuation frames are rejected (FIN must be 1)."
/// Client frames are required to be masked per RFC 6455; an unmasked frame
/// is treated as invalid.
pub fn decode(buf: &[u8]) -> Decoded {
    let total = frame_len(buf);
    if total == 0 {
        return Decoded::Incomplete;
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = match OpCode::from_byte(buf[0] & 0x0F) {
        Some(op) => op,
        None => return Decoded::Invalid("unknown opcode"),
    };
    if !fin {
        return Decoded::Invalid("fragmented frames are not supported");
    }
    if opcode == OpCode::Continuation {
        return Decoded::Invalid("unexpected continuation frame");
    }

    let masked = buf[1] & 0x80 != 0;
    if !masked {
        return Decoded::Invalid("client frame must be masked");
    }
    let len7 = (buf[1] & 0x7F) as usize;
    let mut pos = 2usize;
    let payload_len = match len7 {
        126 => {
            let n = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
            pos += 2;
            n
        }
        127 => {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&buf[pos..pos + 8]);
            pos += 8;
            u64::from_be_bytes(arr) as usize
        }
        n => n,
    };
    let mask = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
    pos += 4;
    let mut payload = buf[pos..pos + payload_len].to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Decoded::Frame { opcode, payload, consumed: total }
}

/// Encodes a server-to-client frame. Server frames are never masked
/// (spec.md §4.5 "Outbound frames").
pub fn encode(opcode: OpCode, payload: &[u8]) -> Text {
    let mut builder = Text::allocate(payload.len() + 10);
    let first = 0x80 | opcode.to_byte();
    builder.append(&[first]);
    if payload.len() <= 125 {
        builder.append(&[payload.len() as u8]);
    } else if payload.len() <= 0xFFFF {
        let len = payload.len() as u16;
        builder.append(&[0x7E]);
        builder.append(&len.to_be_bytes());
    } else {
        let len = payload.len() as u64;
        builder.append(&[0x7F]);
        builder.append(&len.to_be_bytes());
    }
    builder.append(payload);
    builder.finish()
}

pub fn encode_text(payload: &[u8]) -> Text {
    encode(OpCode::Text, payload)
}

pub fn encode_binary(payload: &[u8]) -> Text {
    encode(OpCode::Binary, payload)
}

pub fn encode_pong(payload: &[u8]) -> Text {
    encode(OpCode::Pong, payload)
}

pub fn encode_close() -> Text {
    encode(OpCode::Close, &[])
}

/// Renders the `101 Switching Protocols` handshake response.
pub fn handshake_response(client_key: &str, protocol: Option<&str>) -> String {
    let mut resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept_key(client_key)
    );
    if let Some(protocol) = protocol {
        resp.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }
    resp.push_str("\r\n");
    resp
}

#[cfg(test)]
mod test {
    use super::*;

    fn mask_client_frame(opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut out = vec![0x80 | opcode.to_byte()];
        if payload.len() <= 125 {
            out.push(0x80 | payload.len() as u8);
        } else if payload.len() <= 0xFFFF {
            out.push(0x80 | 126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        for (i, b) in payload.iter().enumerate() {
            out.push(b ^ mask[i % 4]);
        }
        out
    }

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // From spec.md scenario 4 and RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn decode_masked_text_frame() {
        let frame = mask_client_frame(OpCode::Text, b"hi", [1, 2, 3, 4]);
        match decode(&frame) {
            Decoded::Frame { opcode, payload, consumed } => {
                assert_eq!(opcode, OpCode::Text);
                assert_eq!(payload, b"hi");
                assert_eq!(consumed, frame.len());
            }
            _ => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn decode_reports_incomplete_for_partial_frame() {
        let frame = mask_client_frame(OpCode::Text, b"hello world", [9, 9, 9, 9]);
        assert!(matches!(decode(&frame[..3]), Decoded::Incomplete));
    }

    #[test]
    fn decode_rejects_unmasked_client_frame() {
        let mut frame = mask_client_frame(OpCode::Text, b"hi", [0, 0, 0, 0]);
        frame[1] &= 0x7F; // clear the mask bit
        assert!(matches!(decode(&frame), Decoded::Invalid(_)));
    }

    #[test]
    fn decode_rejects_non_final_frames() {
        let mut frame = mask_client_frame(OpCode::Text, b"hi", [1, 1, 1, 1]);
        frame[0] &= 0x7F; // clear FIN
        assert!(matches!(decode(&frame), Decoded::Invalid(_)));
    }

    #[test]
    fn encode_echoes_server_echo_scenario() {
        // spec.md scenario 5: server frame for payload "hi" is 81 02 68 69.
        let text = encode_text(b"hi");
        assert_eq!(text.as_bytes(), &[0x81, 0x02, 0x68, 0x69]);
    }

    #[test]
    fn round_trip_across_all_three_length_encodings() {
        for &len in &[125usize, 126, 65535, 65536] {
            let payload = vec![0x42u8; len];
            let mask = [5, 6, 7, 8];
            let client_frame = mask_client_frame(OpCode::Binary, &payload, mask);
            let decoded = match decode(&client_frame) {
                Decoded::Frame { opcode, payload, .. } => (opcode, payload),
                _ => panic!("frame {len} failed to decode"),
            };
            assert_eq!(decoded.0, OpCode::Binary);
            assert_eq!(decoded.1, payload);

            let server_frame = encode_binary(&payload);
            match decode(&mask_client_frame(
                OpCode::Binary,
                server_frame.as_bytes().split_at(
                    server_frame.as_bytes().len() - len,
                ).1,
                mask,
            )) {
                Decoded::Frame { payload: p, .. } => assert_eq!(p, payload),
                _ => panic!("re-encoded frame {len} failed to decode"),
            }
        }
    }
}
