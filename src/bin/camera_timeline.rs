//! camera_timeline - export camera and feed activity periods as JSON

use anyhow::{anyhow, Result};
use clap::Parser;

use feedwatch::{now_ms, EventTimeline, SqliteStore};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the feedwatch database.
    #[arg(long, env = "FEEDWATCH_DB_PATH", default_value = "feedwatch.db")]
    db_path: String,
    /// Window start, epoch milliseconds (default: 24h before --to).
    #[arg(long)]
    from: Option<i64>,
    /// Window end, epoch milliseconds (default: now).
    #[arg(long)]
    to: Option<i64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let to = args.to.unwrap_or_else(now_ms);
    let from = args.from.unwrap_or(to - DAY_MS);

    let mut store = SqliteStore::open(&args.db_path)?;
    let report = EventTimeline::report(&mut store, from, to)?;
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| anyhow!("failed to serialize timeline: {}", e))?;
    println!("{}", json);
    Ok(())
}
