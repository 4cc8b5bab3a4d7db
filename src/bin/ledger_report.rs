//! Print a PnL report from a ledger file
//!
//! ```bash
//! cargo run --bin ledger_report -- data/ledger.jsonl [--pair ETH/USD] [--days 7] [--recent 20] [--json]
//! ```

use std::env;
use std::path::PathBuf;

use chrono::Utc;
use log::error;

use kraken_gridbot::grid::ledger::{read_entries, LedgerFilter, LedgerReport};

const DEFAULT_RECENT: usize = 10;

struct Args {
    path: PathBuf,
    pair: Option<String>,
    days: Option<i64>,
    recent: usize,
    json: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut path = None;
    let mut pair = None;
    let mut days = None;
    let mut recent = DEFAULT_RECENT;
    let mut json = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--pair" => pair = Some(args.next().ok_or("--pair needs a pair name")?),
            "--days" => {
                let value = args.next().ok_or("--days needs a number")?;
                days = Some(
                    value
                        .parse::<i64>()
                        .map_err(|e| format!("invalid --days {}: {}", value, e))?,
                );
            }
            "--recent" => {
                let value = args.next().ok_or("--recent needs a number")?;
                recent = value
                    .parse::<usize>()
                    .map_err(|e| format!("invalid --recent {}: {}", value, e))?;
            }
            other if other.starts_with("--") => return Err(format!("unknown option {}", other)),
            other => path = Some(PathBuf::from(other)),
        }
    }

    let path = path.unwrap_or_else(|| {
        let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());
        PathBuf::from(data_dir).join("ledger.jsonl")
    });

    Ok(Args {
        path,
        pair,
        days,
        recent,
        json,
    })
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenvy::dotenv().ok();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    if !args.path.exists() {
        error!("Ledger file not found: {}", args.path.display());
        std::process::exit(1);
    }

    let entries = match read_entries(&args.path) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Failed to read ledger {}: {}", args.path.display(), e);
            std::process::exit(1);
        }
    };

    let mut filter = LedgerFilter::default();
    if let Some(pair) = args.pair {
        filter = filter.with_pair(pair);
    }
    if let Some(days) = args.days {
        filter = filter.within_days(days, Utc::now());
    }

    let report = LedgerReport::build(&entries, &filter, args.recent);

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        report.log_report();
    }
}
