//! Wire format for the voice-plane UDP socket. The first byte of every
//! datagram is a type tag; all multi-byte integers are big-endian. See
//! spec §4.4 / §6 for the packet taxonomy.

pub const TAG_HELLO: u8 = 0x01;
pub const TAG_HELLO_ACK: u8 = 0x02;
pub const TAG_HEARTBEAT: u8 = 0x03;
pub const TAG_HEARTBEAT_ACK: u8 = 0x04;
pub const TAG_BYE: u8 = 0x05;
pub const TAG_MEDIA: u8 = 0x10;

pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// A packet successfully decoded off the wire. Lifetimes borrow straight
/// from the receive buffer — nothing here outlives one `recv_from`.
#[derive(Debug)]
pub enum InboundPacket<'a> {
    Hello { token: &'a str },
    Heartbeat { session_id: u32 },
    Bye { session_id: u32 },
    /// `ssrc` is the sender's own SSRC; `payload` is the opaque media blob
    /// that follows it. The router never inspects `payload`.
    Media { ssrc: u32, payload: &'a [u8] },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown type tag {0:#04x}")]
    UnknownTag(u8),
    #[error("truncated packet for tag {0:#04x}")]
    Truncated(u8),
    #[error("HELLO token is not valid UTF-8")]
    InvalidToken,
}

/// Decode a single datagram. Callers must reject datagrams longer than
/// `MAX_DATAGRAM_SIZE` before calling this — that's a transport-level
/// concern, not a framing one.
pub fn decode(data: &[u8]) -> Result<InboundPacket<'_>, DecodeError> {
    let (&tag, rest) = data.split_first().ok_or(DecodeError::Empty)?;
    match tag {
        TAG_HELLO => {
            let token = std::str::from_utf8(rest).map_err(|_| DecodeError::InvalidToken)?;
            Ok(InboundPacket::Hello { token })
        }
        TAG_HEARTBEAT => {
            let session_id = read_u32(rest).ok_or(DecodeError::Truncated(tag))?;
            Ok(InboundPacket::Heartbeat { session_id })
        }
        TAG_BYE => {
            let session_id = read_u32(rest).ok_or(DecodeError::Truncated(tag))?;
            Ok(InboundPacket::Bye { session_id })
        }
        TAG_MEDIA => {
            if rest.len() < 4 {
                return Err(DecodeError::Truncated(tag));
            }
            let ssrc = read_u32(rest).expect("length checked above");
            Ok(InboundPacket::Media { ssrc, payload: &rest[4..] })
        }
        other => Err(DecodeError::UnknownTag(other)),
    }
}

fn read_u32(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(0..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

pub fn encode_hello_ack(session_id: u32, ssrc: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(TAG_HELLO_ACK);
    out.extend_from_slice(&session_id.to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    out
}

pub fn encode_heartbeat_ack() -> Vec<u8> {
    vec![TAG_HEARTBEAT_ACK]
}

/// Builds the outbound MEDIA datagram the router forwards to every other
/// room member: tag, plus the sender's already-framed `ssrc ‖ payload`.
pub fn encode_media(ssrc_and_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + ssrc_and_payload.len());
    out.push(TAG_MEDIA);
    out.extend_from_slice(ssrc_and_payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hello_with_token_payload() {
        let mut data = vec![TAG_HELLO];
        data.extend_from_slice(b"a.token.value");
        match decode(&data).unwrap() {
            InboundPacket::Hello { token } => assert_eq!(token, "a.token.value"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_media_splitting_ssrc_prefix_from_payload() {
        let mut data = vec![TAG_MEDIA];
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(b"audio-frame-1");
        match decode(&data).unwrap() {
            InboundPacket::Media { ssrc, payload } => {
                assert_eq!(ssrc, 100);
                assert_eq!(payload, b"audio-frame-1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_heartbeat() {
        let data = vec![TAG_HEARTBEAT, 0, 1];
        assert!(matches!(decode(&data), Err(DecodeError::Truncated(_))));
    }

    #[test]
    fn rejects_unknown_tag() {
        let data = vec![0xFF, 1, 2, 3];
        assert!(matches!(decode(&data), Err(DecodeError::UnknownTag(0xFF))));
    }

    #[test]
    fn rejects_empty_datagram() {
        assert!(matches!(decode(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn hello_ack_round_trips_session_id_and_ssrc() {
        let encoded = encode_hello_ack(7, 42);
        assert_eq!(encoded[0], TAG_HELLO_ACK);
        assert_eq!(&encoded[1..5], &7u32.to_be_bytes());
        assert_eq!(&encoded[5..9], &42u32.to_be_bytes());
    }
}
