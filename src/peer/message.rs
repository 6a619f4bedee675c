use std::io::{Error, ErrorKind};

/// A decoded peer-wire-protocol message. `KeepAlive` corresponds to the
/// zero-length frame (no type byte). Every other variant corresponds to one
/// of the nine defined message identifiers (0-8); identifiers >= 9 are not
/// represented here — they're unknown to this protocol version and decode
/// to an `Unsupported` error the caller can choose to ignore.
#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
}

impl Message {
    /// Full wire-frame bytes (4-byte big-endian length prefix, then the
    /// type byte and payload for anything but keep-alive), ready to hand to
    /// a socket.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![0, 0, 0, 0],
            Message::Choke => vec![0, 0, 0, 1, 0],
            Message::Unchoke => vec![0, 0, 0, 1, 1],
            Message::Interested => vec![0, 0, 0, 1, 2],
            Message::NotInterested => vec![0, 0, 0, 1, 3],
            Message::Have(index) => {
                let mut msg = vec![0, 0, 0, 5, 4];
                msg.extend_from_slice(&index.to_be_bytes());
                msg
            }
            Message::Bitfield(bitfield) => {
                let len = 1 + bitfield.len() as u32;
                let mut msg = len.to_be_bytes().to_vec();
                msg.push(5);
                msg.extend_from_slice(bitfield);
                msg
            }
            Message::Request(index, begin, length) => {
                let mut msg = vec![0, 0, 0, 13, 6];
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
                msg
            }
            Message::Piece(index, begin, block) => {
                let len = 9 + block.len() as u32;
                let mut msg = len.to_be_bytes().to_vec();
                msg.push(7);
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(block);
                msg
            }
            Message::Cancel(index, begin, length) => {
                let mut msg = vec![0, 0, 0, 13, 8];
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
                msg
            }
        }
    }

    /// Decodes a message body — the bytes following the 4-byte length
    /// prefix — given the frame's declared length `len`. For keep-alive,
    /// `len == 0` and `body` is empty.
    ///
    /// An unknown type identifier (>= 9) decodes to an `Unsupported` error:
    /// the caller should log and continue rather than drop the peer. Any
    /// other decode failure (wrong length for a known id) is `InvalidData`
    /// and the caller should drop the peer.
    pub fn decode(len: u32, body: &[u8]) -> Result<Message, Error> {
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if body.is_empty() {
            return Err(Error::new(ErrorKind::InvalidData, "empty non-keep-alive frame"));
        }
        let id = body[0];
        let msg = match id {
            0 => {
                if len != 1 {
                    return Err(bad_length("choke", len));
                }
                Message::Choke
            }
            1 => {
                if len != 1 {
                    return Err(bad_length("unchoke", len));
                }
                Message::Unchoke
            }
            2 => {
                if len != 1 {
                    return Err(bad_length("interested", len));
                }
                Message::Interested
            }
            3 => {
                if len != 1 {
                    return Err(bad_length("not interested", len));
                }
                Message::NotInterested
            }
            4 => {
                if len != 5 || body.len() < 5 {
                    return Err(bad_length("have", len));
                }
                Message::Have(read_u32(&body[1..5]))
            }
            5 => {
                if body.len() < 1 {
                    return Err(bad_length("bitfield", len));
                }
                Message::Bitfield(body[1..].to_vec())
            }
            6 => {
                if len != 13 || body.len() < 13 {
                    return Err(bad_length("request", len));
                }
                Message::Request(
                    read_u32(&body[1..5]),
                    read_u32(&body[5..9]),
                    read_u32(&body[9..13]),
                )
            }
            7 => {
                if len < 9 || body.len() < 9 {
                    return Err(bad_length("piece", len));
                }
                Message::Piece(
                    read_u32(&body[1..5]),
                    read_u32(&body[5..9]),
                    body[9..].to_vec(),
                )
            }
            8 => {
                if len != 13 || body.len() < 13 {
                    return Err(bad_length("cancel", len));
                }
                Message::Cancel(
                    read_u32(&body[1..5]),
                    read_u32(&body[5..9]),
                    read_u32(&body[9..13]),
                )
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    format!("unknown message id {}", id),
                ))
            }
        };
        Ok(msg)
    }

    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_, _, _) => Some(6),
            Message::Piece(_, _, _) => Some(7),
            Message::Cancel(_, _, _) => Some(8),
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(a)
}

fn bad_length(name: &str, len: u32) -> Error {
    Error::new(
        ErrorKind::InvalidData,
        format!("{} message has wrong length {}", name, len),
    )
}

/// Splits an `encode()`d frame back into `(len, body)`, the shape
/// `decode` expects. Only used by tests and by the session's own framing,
/// which mirrors this split when reading off the wire.
#[cfg(test)]
fn split_frame(bytes: &[u8]) -> (u32, &[u8]) {
    let len = read_u32(&bytes[0..4]);
    (len, &bytes[4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let bytes = msg.encode();
        let (len, body) = split_frame(&bytes);
        let decoded = Message::decode(len, body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrips_every_kind() {
        roundtrip(Message::KeepAlive);
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have(7));
        roundtrip(Message::Bitfield(vec![0b1010_0000, 0]));
        roundtrip(Message::Request(1, 16384, 16384));
        roundtrip(Message::Piece(1, 0, vec![1, 2, 3, 4]));
        roundtrip(Message::Cancel(1, 16384, 16384));
    }

    #[test]
    fn cancel_does_not_decode_as_request() {
        let bytes = Message::Cancel(3, 4, 5).encode();
        let (len, body) = split_frame(&bytes);
        let decoded = Message::decode(len, body).unwrap();
        assert!(matches!(decoded, Message::Cancel(3, 4, 5)));
        assert!(!matches!(decoded, Message::Request(..)));
    }

    #[test]
    fn unknown_id_is_unsupported_not_fatal() {
        // id 9 (BEP-5 port) is outside the closed 0-8 set this protocol
        // version defines; it must be distinguishable from a malformed frame.
        let body = vec![9u8, 0, 0];
        let err = Message::decode(3, &body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn wrong_length_for_known_id_is_invalid_data() {
        let body = vec![0u8, 0xff]; // choke (id 0) with an extra byte
        let err = Message::decode(2, &body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn bitfield_accepts_any_nonzero_payload_length() {
        let body = vec![5u8, 0xff, 0xff, 0xff];
        let decoded = Message::decode(4, &body).unwrap();
        assert_eq!(decoded, Message::Bitfield(vec![0xff, 0xff, 0xff]));
    }
}
