//! HTTP tracker announce client (BEP 3). A thin, synchronous, one-shot
//! request/response exchange — tracker announces are infrequent (on the
//! order of minutes) so this deliberately does not participate in the
//! coordinator's non-blocking `mio::Poll` loop.

use crate::bitfield::BitField;
use crate::torrent::DownloadPlan;
use anyhow::{bail, Context};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    /// A regular re-announce, sent with no `event` parameter at all.
    Empty,
}

impl Event {
    fn as_query_value(self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::Empty => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceResult {
    pub interval: u64,
    pub peers: Vec<SocketAddr>,
}

impl Default for AnnounceResult {
    /// A conservative fallback interval for when the initial announce
    /// fails outright and the coordinator must still pick something to
    /// wait before retrying.
    fn default() -> Self {
        AnnounceResult {
            interval: 900,
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default, rename = "min interval")]
    min_interval: Option<i64>,
    #[serde(default)]
    peers: Peers,
}

/// The `peers` field of an announce response, in either of BEP 3's two
/// encodings: a single byte string of 6-byte-per-peer entries (`compact=1`),
/// or a list of `{ip, port, peer id}` dictionaries (`compact=0`).
#[derive(Debug, Default)]
struct Peers(Vec<SocketAddr>);

impl<'de> Deserialize<'de> for Peers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PeersVisitor;

        impl<'de> Visitor<'de> for PeersVisitor {
            type Value = Peers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a compact peer byte string or a list of peer dictionaries")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Peers, E>
            where
                E: de::Error,
            {
                if v.len() % 6 != 0 {
                    return Err(E::custom("compact peers string length not a multiple of 6"));
                }
                let peers = v
                    .chunks(6)
                    .map(|chunk| {
                        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                        SocketAddr::new(IpAddr::V4(ip), port)
                    })
                    .collect();
                Ok(Peers(peers))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Peers, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                #[derive(Deserialize)]
                struct PeerDict {
                    ip: String,
                    port: u16,
                }
                let mut peers = Vec::new();
                while let Some(entry) = seq.next_element::<PeerDict>()? {
                    match entry.ip.parse::<IpAddr>() {
                        Ok(ip) => peers.push(SocketAddr::new(ip, entry.port)),
                        Err(_) => {
                            if let Ok(mut addrs) = (entry.ip.as_str(), entry.port).to_socket_addrs() {
                                if let Some(addr) = addrs.next() {
                                    peers.push(addr);
                                }
                            }
                        }
                    }
                }
                Ok(Peers(peers))
            }
        }

        deserializer.deserialize_any(PeersVisitor)
    }
}

fn bytes_owned(plan: &DownloadPlan, bitfield: &BitField) -> u64 {
    bitfield
        .pieces()
        .iter()
        .map(|&index| {
            if index as u64 == plan.num_pieces - 1 {
                plan.final_piece_length as u64
            } else {
                plan.piece_length as u64
            }
        })
        .sum()
}

fn build_query(plan: &DownloadPlan, uploaded: u64, downloaded: u64, left: u64, event: Event) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}",
        urlencoding::encode_binary(&plan.info_hash),
        urlencoding::encode_binary(&plan.peer_id),
        plan.listen_port,
        uploaded,
        downloaded,
        left,
        if plan.compact { 1 } else { 0 },
    );
    if let Some(value) = event.as_query_value() {
        query.push_str("&event=");
        query.push_str(value);
    }
    query
}

/// Performs one announce and returns the tracker's reported interval and
/// peer list. Blocking, synchronous HTTP/1.1 over a fresh TCP connection —
/// trackers are contacted far too rarely to justify a persistent client.
pub fn announce_event(
    plan: &DownloadPlan,
    bitfield: &BitField,
    uploaded: u64,
    downloaded: u64,
    event: Event,
) -> anyhow::Result<AnnounceResult> {
    let left = plan.length.saturating_sub(bytes_owned(plan, bitfield));
    let url = Url::parse(&plan.announce).context("invalid announce URL")?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("unsupported tracker scheme: {}", url.scheme());
    }
    let host = url.host_str().context("announce URL has no host")?;
    let port = url.port_or_known_default().unwrap_or(80);
    let path = if url.path().is_empty() { "/" } else { url.path() };
    let query = build_query(plan, uploaded, downloaded, left, event);
    let separator = if url.query().is_some() { "&" } else { "?" };

    let mut stream = TcpStream::connect((host, port)).context("connecting to tracker")?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    let request = format!(
        "GET {path}{orig_query}{separator}{query} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: close\r\n\
         User-Agent: bobby-bit/1.0\r\n\
         \r\n",
        path = path,
        orig_query = url.query().map(|q| format!("?{q}")).unwrap_or_default(),
        separator = separator,
        query = query,
        host = host,
    );
    stream.write_all(request.as_bytes())?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let body = parse_http_body(&raw)?;

    let parsed: RawAnnounceResponse =
        serde_bencode::from_bytes(body).context("failed to decode tracker announce response")?;
    if let Some(reason) = parsed.failure_reason {
        bail!("tracker announce failed: {reason}");
    }

    Ok(AnnounceResult {
        interval: parsed
            .min_interval
            .or(parsed.interval)
            .unwrap_or(900)
            .max(1) as u64,
        peers: parsed.peers.0,
    })
}

/// Splits a raw HTTP/1.1 response into its body, validating the status
/// line via `httparse` rather than hand-scanning for `\r\n\r\n`.
fn parse_http_body(raw: &[u8]) -> anyhow::Result<&[u8]> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let status = response
        .parse(raw)
        .context("malformed HTTP response from tracker")?;
    let header_len = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => bail!("incomplete HTTP response from tracker"),
    };
    match response.code {
        Some(code) if (200..300).contains(&code) => {}
        Some(code) => bail!("tracker returned HTTP {code}"),
        None => bail!("tracker response has no status code"),
    }
    Ok(&raw[header_len..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan(compact: bool) -> DownloadPlan {
        DownloadPlan {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            name: "test".to_string(),
            announce: "http://tracker.example.invalid:6969/announce".to_string(),
            length: 32768,
            piece_length: 16384,
            num_pieces: 2,
            final_piece_length: 16384,
            piece_hashes: vec![[0u8; 20], [0u8; 20]],
            output_path: "out".into(),
            listen_port: 6881,
            compact,
            seeder: false,
        }
    }

    #[test]
    fn build_query_uses_listen_port_not_url_port() {
        let plan = sample_plan(true);
        let query = build_query(&plan, 0, 0, plan.length, Event::Started);
        assert!(query.contains("port=6881"));
        assert!(query.contains("event=started"));
        assert!(query.contains("compact=1"));
    }

    #[test]
    fn empty_event_omits_event_param() {
        let plan = sample_plan(false);
        let query = build_query(&plan, 0, 0, plan.length, Event::Empty);
        assert!(!query.contains("event="));
        assert!(query.contains("compact=0"));
    }

    #[test]
    fn bytes_owned_accounts_for_final_piece_length() {
        let plan = sample_plan(true);
        let mut bf = BitField::new(2);
        bf.set(0);
        bf.set(1);
        assert_eq!(bytes_owned(&plan, &bf), 32768);
    }

    #[test]
    fn parses_compact_peers_response() {
        let mut body = b"d8:intervali900e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]); // 127.0.0.1:6881
        body.push(b'e');
        let parsed: RawAnnounceResponse = serde_bencode::from_bytes(&body).unwrap();
        assert_eq!(parsed.interval, Some(900));
        assert_eq!(parsed.peers.0, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn parse_http_body_rejects_non_2xx_status() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        assert!(parse_http_body(raw).is_err());
    }

    #[test]
    fn parse_http_body_extracts_bytes_after_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(parse_http_body(raw).unwrap(), b"hello");
    }
}
