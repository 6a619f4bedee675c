use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize)]
pub struct Node(String, i64);

/// A file entry in a multi-file torrent's `info.files` list. Parsed for
/// fidelity with real `.torrent` files; `DownloadPlan` rejects any torrent
/// where `files` is present (multi-file torrents are out of scope).
#[derive(Debug, Deserialize, Serialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    /// concatenation of all 20-byte SHA1 piece hashes (raw bytes).
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub files: Option<Vec<File>>,
    #[serde(default)]
    pub private: Option<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Torrent {
    pub info: Info,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default)]
    nodes: Option<Vec<Node>>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    httpseeds: Option<Vec<String>>,
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
}

impl Torrent {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        from_bytes(bytes).context("failed to deserialize torrent")
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        Self::from_path(Path::new(path))
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("opening torrent file {}", path.display()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    pub fn info_hash(&self) -> [u8; 20] {
        let bytes = to_bytes(&self.info).expect("info dict is always bencode-serializable");
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    pub fn announce(&self) -> anyhow::Result<&str> {
        self.announce
            .as_deref()
            .context("torrent has no announce URL")
    }

    /// Total length in bytes. Multi-file torrents (no top-level `length`)
    /// sum their file list for fidelity, but `DownloadPlan` refuses to plan
    /// a download for them.
    pub fn length(&self) -> anyhow::Result<i64> {
        if let Some(length) = self.info.length {
            return Ok(length);
        }
        match &self.info.files {
            Some(files) => Ok(files.iter().map(|f| f.length).sum()),
            None => bail!("torrent info has neither length nor files"),
        }
    }

    pub fn is_multi_file(&self) -> bool {
        self.info.length.is_none()
    }

    pub fn piece_length(&self) -> i64 {
        self.info.piece_length
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut array = [0u8; 20];
                array.copy_from_slice(chunk);
                array
            })
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

/// Adapts a `Torrent` plus the CLI's runtime choices into the concrete
/// numbers the coordinator needs: file length `L`, piece length `P`,
/// piece count `N`, the (possibly short) final piece length, the output
/// path, the announce URL, the info hash and a freshly generated peer id.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub name: String,
    pub announce: String,
    pub length: u64,
    pub piece_length: u32,
    pub num_pieces: u64,
    pub final_piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub output_path: PathBuf,
    pub listen_port: u16,
    pub compact: bool,
    pub seeder: bool,
}

impl DownloadPlan {
    pub fn new(
        torrent: &Torrent,
        peer_id: [u8; 20],
        output_path: PathBuf,
        listen_port: u16,
        compact: bool,
        seeder: bool,
    ) -> anyhow::Result<DownloadPlan> {
        if torrent.is_multi_file() {
            bail!("multi-file torrents are not supported");
        }

        let length = torrent.length()? as u64;
        let piece_length = torrent.piece_length() as u32;
        let piece_hashes = torrent.piece_hashes();
        let num_pieces = piece_hashes.len() as u64;
        if num_pieces == 0 || piece_length == 0 {
            bail!("torrent has no pieces");
        }

        let final_piece_length = (length - (num_pieces - 1) * piece_length as u64) as u32;
        if final_piece_length == 0 || final_piece_length > piece_length {
            bail!("final piece length out of range");
        }

        Ok(DownloadPlan {
            info_hash: torrent.info_hash(),
            peer_id,
            name: torrent.name().to_string(),
            announce: torrent.announce()?.to_string(),
            length,
            piece_length,
            num_pieces,
            final_piece_length,
            piece_hashes,
            output_path,
            listen_port,
            compact,
            seeder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bencode::to_bytes;

    fn sample_torrent_bytes(piece_length: i64, total_len: i64) -> Vec<u8> {
        let pieces = ByteBuf::from(vec![0u8; 20]);
        let info = Info {
            name: "sample.bin".to_string(),
            pieces,
            piece_length,
            md5sum: None,
            length: Some(total_len),
            files: None,
            private: None,
        };
        let torrent = Torrent {
            info,
            announce: Some("http://tracker.example/announce".to_string()),
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        };
        to_bytes(&torrent).unwrap()
    }

    #[test]
    fn parses_single_file_torrent() {
        let bytes = sample_torrent_bytes(32768, 32768);
        let torrent = Torrent::from_bytes(&bytes).unwrap();
        assert_eq!(torrent.name(), "sample.bin");
        assert_eq!(torrent.announce().unwrap(), "http://tracker.example/announce");
        assert_eq!(torrent.length().unwrap(), 32768);
        assert!(!torrent.is_multi_file());
    }

    #[test]
    fn download_plan_computes_final_piece_length() {
        let bytes = sample_torrent_bytes(32768, 32768 * 6 + 100);
        let mut torrent = Torrent::from_bytes(&bytes).unwrap();
        torrent.info.pieces = ByteBuf::from(vec![0u8; 20 * 7]);
        let plan = DownloadPlan::new(&torrent, [1u8; 20], PathBuf::from("out"), 6881, true, false)
            .unwrap();
        assert_eq!(plan.num_pieces, 7);
        assert_eq!(plan.piece_length, 32768);
        assert_eq!(plan.final_piece_length, 100);
    }

    #[test]
    fn download_plan_rejects_multi_file_torrents() {
        let info = Info {
            name: "multi".to_string(),
            pieces: ByteBuf::from(vec![0u8; 20]),
            piece_length: 16384,
            md5sum: None,
            length: None,
            files: Some(vec![File {
                path: vec!["a".to_string()],
                length: 10,
                md5sum: None,
            }]),
            private: None,
        };
        let torrent = Torrent {
            info,
            announce: Some("http://tracker.example/announce".to_string()),
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        };
        let result = DownloadPlan::new(&torrent, [1u8; 20], PathBuf::from("out"), 6881, true, false);
        assert!(result.is_err());
    }
}
