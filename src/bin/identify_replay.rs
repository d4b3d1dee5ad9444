//! identify-replay
//!
//! Replays JSON-lines identify requests against an in-memory store and prints
//! one JSON line per response or failure.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use kyro_identity::{
    IdentifyRequest, IdentityConfig, InMemoryContactStore, IntegrityGuard, Resolver,
};

/// Command line options.
#[derive(Default)]
struct Args {
    /// JSON config document
    config: Option<PathBuf>,
    /// Requests file; stdin when absent
    input: Option<PathBuf>,
    /// Run an integrity pass after the replay
    repair: bool,
}

fn usage() {
    println!("identify-replay - replay identify requests against an in-memory store");
    println!();
    println!("USAGE:");
    println!("    identify-replay [OPTIONS] < requests.jsonl");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>       JSON config document");
    println!("    -i, --input <FILE>        Read requests from FILE instead of stdin");
    println!("    -r, --repair              Run an integrity pass after the replay");
    println!("    -h, --help                Print help information");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut parsed = Args::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let value = args.get(i + 1).ok_or("--config requires a value")?;
                parsed.config = Some(PathBuf::from(value));
                i += 2;
            }
            "--input" | "-i" => {
                let value = args.get(i + 1).ok_or("--input requires a value")?;
                parsed.input = Some(PathBuf::from(value));
                i += 2;
            }
            "--repair" | "-r" => {
                parsed.repair = true;
                i += 1;
            }
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(parsed)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => IdentityConfig::from_json_str(&fs::read_to_string(path)?)?,
        None => IdentityConfig::default(),
    };

    let store = Arc::new(InMemoryContactStore::new());
    let resolver = Resolver::with_config(store.clone(), config.resolver);

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(fs::File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rendered = match serde_json::from_str::<IdentifyRequest>(&line) {
            Ok(request) => match resolver.identify(&request) {
                Ok(response) => serde_json::to_string(&response)?,
                Err(e) => serde_json::to_string(&serde_json::json!({ "error": e.to_failure() }))?,
            },
            Err(e) => {
                tracing::warn!(line = lineno + 1, error = %e, "skipping malformed request");
                continue;
            }
        };
        writeln!(out, "{rendered}")?;
    }

    if args.repair {
        let guard = IntegrityGuard::with_config(store.clone(), config.integrity);
        let report = guard.repair()?;
        writeln!(out, "{}", serde_json::to_string(&serde_json::json!({ "repair": report }))?)?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            usage();
            std::process::exit(2);
        }
    };

    if let Err(e) = run(args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
