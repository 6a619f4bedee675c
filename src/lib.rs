pub mod bitfield;
pub mod coordinator;
pub mod storage;
pub mod torrent;
pub mod utils;

pub mod tracker {
    pub mod http;
    pub mod udp;
}

pub mod peer {
    pub mod handshake;
    pub mod message;
    pub mod session;
}

/// Size of a block, the unit of request/transfer within a piece (2^14 bytes).
pub const BLOCK_LEN: u32 = 16384;
