use bobby_bit::coordinator::Coordinator;
use bobby_bit::storage::PieceStore;
use bobby_bit::torrent::{DownloadPlan, Torrent};
use bobby_bit::utils;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// A single-file BitTorrent leecher/seeder.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the .torrent metainfo file.
    file: String,

    /// Request a compact (1) or dictionary-form (0) peer list from the tracker.
    #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
    compact: u8,

    /// TCP port to listen for incoming peer connections on (conventionally 6881-6889).
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Path where the downloaded file is written (or read from, in seed mode).
    /// Defaults to the torrent's own file name.
    #[arg(short, long)]
    out: Option<String>,

    /// Seed an already-complete file instead of downloading it (1 = seed, 0 = leech).
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    seed: u8,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();

    if let Err(e) = run(args) {
        log::error!("{e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(args: Cli) -> anyhow::Result<()> {
    let peer_id = utils::generate_peer_id();
    let torrent = Torrent::from_file(&args.file)?;
    let compact = args.compact != 0;
    let seeder = args.seed != 0;
    let out = args.out.unwrap_or_else(|| torrent.name().to_string());

    if seeder && !PathBuf::from(&out).exists() {
        anyhow::bail!("seeder mode requires an existing file at {}", out);
    }

    let plan = DownloadPlan::new(&torrent, peer_id, PathBuf::from(&out), args.port, compact, seeder)?;

    log::info!(
        "{} {} ({} pieces, {} bytes)",
        if seeder { "seeding" } else { "downloading" },
        plan.name,
        plan.num_pieces,
        plan.length
    );

    let store = PieceStore::new(&plan);
    let mut coordinator = Coordinator::bootstrap(plan, store)?;
    coordinator.run()
}
