//! Owns the file-backed piece/block table, per-piece hash verification, and
//! the local bitfield. Persistence is piece-granular: the backing file is
//! opened, seeked and written once per verified piece, never held open
//! across calls.

use crate::bitfield::BitField;
use crate::torrent::DownloadPlan;
use crate::BLOCK_LEN;
use mio::Token;
use sha1::{Digest, Sha1};
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Instant;

/// A contiguous slice of a piece, the unit of request and transfer.
#[derive(Debug, Clone)]
pub struct Block {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
    pub gathered: bool,
    /// The peer currently assigned to fetch this block, if any. A back
    /// reference only — the store never owns a peer.
    pub sent_to: Option<Token>,
    pub requested_at: Option<Instant>,
}

impl Block {
    fn new(piece_index: u32, begin: u32, length: u32) -> Block {
        Block {
            piece_index,
            begin,
            length,
            gathered: false,
            sent_to: None,
            requested_at: None,
        }
    }

    fn reset(&mut self) {
        self.gathered = false;
        self.sent_to = None;
        self.requested_at = None;
    }
}

/// A fixed-size (except the last) contiguous region of the target file, the
/// unit of integrity verification.
#[derive(Debug)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
    pub blocks: Vec<Block>,
    pub data: Vec<u8>,
    pub finished: bool,
}

impl Piece {
    fn new(index: u32, length: u32, hash: [u8; 20]) -> Piece {
        let mut blocks = Vec::new();
        let mut begin = 0u32;
        while begin < length {
            let block_len = BLOCK_LEN.min(length - begin);
            blocks.push(Block::new(index, begin, block_len));
            begin += block_len;
        }
        Piece {
            index,
            length,
            hash,
            blocks,
            data: vec![0; length as usize],
            finished: false,
        }
    }

    fn all_gathered(&self) -> bool {
        self.blocks.iter().all(|b| b.gathered)
    }

    fn digest_matches(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }

    fn reset(&mut self) {
        for block in &mut self.blocks {
            block.reset();
        }
        self.data.iter_mut().for_each(|b| *b = 0);
        self.finished = false;
    }
}

pub struct PieceStore {
    path: PathBuf,
    file_length: u64,
    piece_length: u32,
    pieces: Vec<Piece>,
    bitfield: BitField,
}

impl PieceStore {
    pub fn new(plan: &DownloadPlan) -> PieceStore {
        let hashes = &plan.piece_hashes;
        let mut pieces = Vec::with_capacity(hashes.len());
        for (index, hash) in hashes.iter().enumerate() {
            let length = if index as u64 == plan.num_pieces - 1 {
                plan.final_piece_length
            } else {
                plan.piece_length
            };
            pieces.push(Piece::new(index as u32, length, *hash));
        }
        PieceStore {
            path: plan.output_path.clone(),
            file_length: plan.length,
            piece_length: plan.piece_length,
            bitfield: BitField::new(pieces.len()),
            pieces,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn bitfield(&self) -> &BitField {
        &self.bitfield
    }

    pub fn piece(&self, index: usize) -> &Piece {
        &self.pieces[index]
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn pieces_mut(&mut self) -> &mut [Piece] {
        &mut self.pieces
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.is_complete()
    }

    /// Marks every piece and bitfield bit as locally owned — used to seed a
    /// store in seeder mode from a backing file already known to match.
    pub fn mark_all_owned(&mut self) {
        for index in 0..self.pieces.len() {
            self.bitfield.set(index);
            self.pieces[index].finished = true;
        }
    }

    /// Ingests a received block payload. Locates the block slot at
    /// `begin` within piece `index`; a payload whose length doesn't match
    /// the slot's declared length is ignored. Returns whether the piece
    /// became finished (all slots gathered) as a result.
    pub fn ingest_block(&mut self, index: u32, begin: u32, data: &[u8]) -> io::Result<bool> {
        let piece = self
            .pieces
            .get_mut(index as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "piece index out of range"))?;
        if piece.finished {
            return Ok(false);
        }
        let block = piece
            .blocks
            .iter_mut()
            .find(|b| b.begin == begin)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no block at offset"))?;
        if data.len() as u32 != block.length {
            return Ok(false);
        }
        let start = begin as usize;
        piece.data[start..start + data.len()].copy_from_slice(data);
        block.gathered = true;
        block.sent_to = None;
        block.requested_at = None;

        let became_finished = piece.all_gathered();
        piece.finished = became_finished;
        Ok(became_finished)
    }

    /// Validates a finished piece's digest. On mismatch the piece is reset
    /// (re-requestable) and this returns `Ok(false)`. On success the piece
    /// is written to the backing file and the bitfield bit is set.
    pub fn verify_and_persist(&mut self, index: usize) -> io::Result<bool> {
        let piece = &mut self.pieces[index];
        if !piece.digest_matches() {
            piece.reset();
            return Ok(false);
        }

        let offset = index as u64 * self.piece_length as u64;
        let write_len = (piece.data.len() as u64).min(self.file_length.saturating_sub(offset));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&piece.data[..write_len as usize])?;

        self.bitfield.set(index);
        Ok(true)
    }

    /// Reads `length` bytes of piece `index` at offset `begin`, for serving
    /// a `request` message. The caller must already know the piece is owned.
    pub fn read_block_for_request(&self, index: u32, begin: u32, length: u32) -> io::Result<Vec<u8>> {
        let offset = index as u64 * self.piece_length as u64 + begin as u64;
        let mut file = OpenOptions::new().read(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn plan_for(content: &[u8], piece_length: u32, out_path: PathBuf) -> (DownloadPlan, Vec<u8>) {
        let mut hashes = Vec::new();
        for chunk in content.chunks(piece_length as usize) {
            hashes.push(sha1(chunk));
        }
        let plan = DownloadPlan {
            info_hash: [0u8; 20],
            peer_id: [0u8; 20],
            name: "test".to_string(),
            announce: "http://example.invalid/announce".to_string(),
            length: content.len() as u64,
            piece_length,
            num_pieces: hashes.len() as u64,
            final_piece_length: (content.len() as u64 - (hashes.len() as u64 - 1) * piece_length as u64) as u32,
            piece_hashes: hashes,
            output_path: out_path,
            listen_port: 6881,
            compact: true,
            seeder: false,
        };
        (plan, content.to_vec())
    }

    #[test]
    fn ingest_finishes_piece_and_persists_on_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let content = vec![7u8; (BLOCK_LEN * 2) as usize];
        let (plan, _) = plan_for(&content, BLOCK_LEN * 2, path.clone());
        let mut store = PieceStore::new(&plan);

        assert_eq!(store.num_pieces(), 1);
        let block0 = content[..BLOCK_LEN as usize].to_vec();
        let block1 = content[BLOCK_LEN as usize..].to_vec();
        assert!(!store.ingest_block(0, 0, &block0).unwrap());
        assert!(store.ingest_block(0, BLOCK_LEN, &block1).unwrap());

        assert!(store.verify_and_persist(0).unwrap());
        assert!(store.bitfield().is_set(0));

        let mut written = Vec::new();
        std::fs::File::open(&path).unwrap().read_to_end(&mut written).unwrap();
        assert_eq!(written, content);
    }

    #[test]
    fn digest_mismatch_resets_piece() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let content = vec![1u8; BLOCK_LEN as usize];
        let (plan, _) = plan_for(&content, BLOCK_LEN, path);
        let mut store = PieceStore::new(&plan);

        let corrupt = vec![2u8; BLOCK_LEN as usize];
        assert!(store.ingest_block(0, 0, &corrupt).unwrap());
        assert!(!store.verify_and_persist(0).unwrap());
        assert!(!store.bitfield().is_set(0));
        assert!(!store.piece(0).finished);
        assert!(!store.piece(0).blocks[0].gathered);
    }

    #[test]
    fn mismatched_length_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let content = vec![1u8; BLOCK_LEN as usize];
        let (plan, _) = plan_for(&content, BLOCK_LEN, path);
        let mut store = PieceStore::new(&plan);

        let wrong_len = vec![1u8; BLOCK_LEN as usize - 1];
        assert!(!store.ingest_block(0, 0, &wrong_len).unwrap());
        assert!(!store.piece(0).blocks[0].gathered);
    }

    #[test]
    fn final_piece_write_does_not_extend_past_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        // two pieces: one full, one short final piece
        let mut content = vec![3u8; BLOCK_LEN as usize];
        content.extend(vec![4u8; 100]);
        let (plan, _) = plan_for(&content, BLOCK_LEN, path.clone());
        let mut store = PieceStore::new(&plan);

        assert_eq!(store.num_pieces(), 2);
        assert_eq!(store.piece(1).length, 100);

        let full = content[..BLOCK_LEN as usize].to_vec();
        assert!(store.ingest_block(0, 0, &full).unwrap());
        store.verify_and_persist(0).unwrap();

        let tail = content[BLOCK_LEN as usize..].to_vec();
        assert!(store.ingest_block(1, 0, &tail).unwrap());
        store.verify_and_persist(1).unwrap();

        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.len(), content.len() as u64);
    }

    #[test]
    fn idempotent_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let content = vec![9u8; BLOCK_LEN as usize];
        let (plan, _) = plan_for(&content, BLOCK_LEN, path.clone());
        let mut store = PieceStore::new(&plan);

        store.ingest_block(0, 0, &content).unwrap();
        store.verify_and_persist(0).unwrap();
        let first = std::fs::read(&path).unwrap();
        store.verify_and_persist(0).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }
}
