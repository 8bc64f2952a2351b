use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use swiftget_core::config::TransferConfig;
use swiftget_core::engine::{Engine, EngineConfig};
use swiftget_core::progress::ProgressObserver;

mod terminal_observer;
use terminal_observer::TerminalProgressObserver;

/// Segmented HTTP(S) download manager.
#[derive(Parser)]
#[command(name = "swiftget", version, about = "Segmented HTTP(S) download manager")]
struct Args {
    /// URL(s) to download
    #[arg(required = true)]
    urls: Vec<String>,

    /// Destination directory
    #[arg(short = 'd', long, default_value = ".")]
    directory: PathBuf,

    /// Output filename override (only meaningful with a single URL)
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Number of parallel range connections
    #[arg(short = 'n', long, default_value_t = 8)]
    connections: usize,

    /// Cap throughput, in bytes/sec (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_bps: u64,

    /// Override the default User-Agent
    #[arg(long)]
    user_agent: Option<String>,

    /// Extra request header, "Key: Value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Proxy URI (overrides http_proxy/https_proxy/no_proxy)
    #[arg(long)]
    proxy: Option<String>,

    /// Expected checksum as "algorithm:hex" (md5, sha1, sha256)
    #[arg(long)]
    checksum: Option<String>,

    /// Resume a partially-downloaded file (single-connection path only)
    #[arg(long)]
    resume: bool,

    /// Suppress the progress display; errors still go to stderr
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Log every state transition, retry decision, and rebalance event
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Extract the file after download (delegated to a system tool; not
    /// implemented by the engine itself)
    #[arg(long)]
    extract_after: bool,

    /// Reveal the file in the desktop shell after download (not implemented
    /// by the engine itself)
    #[arg(long)]
    reveal_after: bool,
}

fn parse_header(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once(':')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

fn build_transfer_config(args: &Args, url: String) -> Result<TransferConfig, u8> {
    let headers: Vec<(String, String)> = args
        .headers
        .iter()
        .filter_map(|h| {
            let parsed = parse_header(h);
            if parsed.is_none() {
                eprintln!("invalid header '{}', expected 'Key: Value'", h);
            }
            parsed
        })
        .collect();
    if headers.len() != args.headers.len() {
        return Err(2);
    }

    let checksum = match &args.checksum {
        Some(spec) => match TransferConfig::parse_checksum(spec) {
            Ok(digest) => Some(digest),
            Err(e) => {
                eprintln!("{}", e);
                return Err(2);
            }
        },
        None => None,
    };

    let cfg = TransferConfig {
        url,
        destination_dir: args.directory.clone(),
        filename_override: args.output.clone(),
        connections: args.connections,
        max_bps: args.max_bps,
        user_agent: args.user_agent.clone().unwrap_or_else(|| "SwiftGet/2.0.0".to_string()),
        headers,
        proxy: args.proxy.clone(),
        checksum,
        resume: args.resume,
        quiet: args.quiet,
        verbose: args.verbose,
        show_progress: !args.quiet,
        verify_tls: !args.insecure,
        extract_after: args.extract_after,
        reveal_after: args.reveal_after,
    };

    if let Err(e) = cfg.validate() {
        eprintln!("{}", e);
        return Err(2);
    }

    Ok(cfg)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.verbose {
        std::env::set_var("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".into()));
    }
    env_logger::init();

    if args.output.is_some() && args.urls.len() > 1 {
        eprintln!("--output can only be used with a single URL");
        return ExitCode::from(2);
    }

    let engine = Engine::new(EngineConfig::default());
    let mut any_failed = false;

    for url in &args.urls {
        let cfg = match build_transfer_config(&args, url.clone()) {
            Ok(cfg) => cfg,
            Err(code) => return ExitCode::from(code),
        };

        let observers: Vec<Box<dyn ProgressObserver>> = if cfg.show_progress {
            vec![Box::new(TerminalProgressObserver::new())]
        } else {
            vec![]
        };

        println!("Starting download: {}", url);
        match engine.download(&cfg, observers).await {
            Ok(stats) => {
                println!("Completed: {} bytes in {} segment(s)", stats.bytes_downloaded, stats.segments_total);
            }
            Err(e) => {
                eprintln!("Download failed for {}: {}", url, e);
                any_failed = true;
            }
        }
    }

    if any_failed {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
