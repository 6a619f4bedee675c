use std::io::{Error, ErrorKind};

pub const PSTR: &str = "BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// The fixed 68-byte prelude exchanged on every new peer connection.
#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    /// protocol identifier (19 bytes), always "BitTorrent protocol" here.
    pub pstr: String,
    /// 8 reserved bytes. This implementation never sets extension bits.
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    /// 20-byte unique client id.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            pstr: PSTR.to_string(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Parses a handshake from exactly 68 bytes. Rejects any frame whose
    /// first 20 bytes don't match the fixed `19 "BitTorrent protocol"`
    /// prefix.
    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, Error> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "handshake must be exactly 68 bytes",
            ));
        }
        if bytes[0] != 19 || &bytes[1..20] != PSTR.as_bytes() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "handshake prefix mismatch",
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Handshake {
            pstr: PSTR.to_string(),
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0; HANDSHAKE_LEN];
        bytes[0] = 19;
        bytes[1..20].copy_from_slice(self.pstr.as_bytes());
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    /// Whether this handshake names the torrent we expect.
    pub fn check(&self, info_hash: &[u8; 20]) -> bool {
        &self.info_hash == info_hash && self.pstr == PSTR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let hs = Handshake::new([7u8; 20], [9u8; 20]);
        let bytes = hs.to_bytes();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        let hs2 = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(hs, hs2);
    }

    #[test]
    fn check_matches_info_hash() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.check(&[1u8; 20]));
        assert!(!hs.check(&[3u8; 20]));
    }

    #[test]
    fn rejects_bad_prefix() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).to_bytes();
        bytes[0] = 18;
        assert!(Handshake::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Handshake::from_bytes(&[0u8; 67]).is_err());
        assert!(Handshake::from_bytes(&[0u8; 69]).is_err());
    }
}
