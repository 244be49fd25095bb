// main.rs

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use dfget::config::{init_tracing, parse_rate, Config};
use dfget::task::Pattern;

/// Download a file through the p2p network, falling back to the source.
#[derive(Debug, Parser)]
#[command(name = "dfget", version, about)]
struct Args {
    /// Url of the file to download.
    url: String,

    /// Where to store the file.
    #[arg(short, long)]
    output: PathBuf,

    /// Expected md5 of the file.
    #[arg(long, default_value = "")]
    md5: String,

    /// Extra header for the source, as `Key: Value`. Repeatable.
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Never download from the source.
    #[arg(long)]
    notbs: bool,

    /// Overall timeout in seconds, 0 derives it from the file length.
    #[arg(long)]
    timeout: Option<u64>,

    /// Local rate limit, e.g. 20M.
    #[arg(long)]
    locallimit: Option<String>,

    /// Supernode `host:port`. Repeatable, overrides the config file.
    #[arg(long = "node")]
    nodes: Vec<String>,

    #[arg(long)]
    pattern: Option<Pattern>,

    #[arg(long, default_value = "dfget.toml")]
    config: PathBuf,

    /// Identifies the file when no md5 is given.
    #[arg(long, default_value = "")]
    identifier: String,

    /// Name of the calling system.
    #[arg(long, default_value = "")]
    callsystem: String,
}

async fn run(args: Args, config: Config) -> error::Result<()> {
    let mut task = config.task(&args.url, &args.output)?;
    task.md5 = args.md5;
    task.identifier = args.identifier;
    task.call_system = args.callsystem;
    task.headers = args.headers;
    task.not_back_source |= args.notbs;
    if let Some(secs) = args.timeout {
        task.timeout = Duration::from_secs(secs);
    }
    if let Some(limit) = args.locallimit {
        task.local_limit = parse_rate(&limit)?;
    }
    if let Some(pattern) = args.pattern {
        task.pattern = pattern;
    }
    let nodes = if args.nodes.is_empty() {
        config.supernode.nodes.clone()
    } else {
        args.nodes
    };

    info!(url = %task.url, target = %task.target.display(), pattern = ?task.pattern, "start download");
    dfget::start(task, nodes).await?;
    Ok(())
}

mod error {
    use dfget::config::ConfigError;
    use dfget::downloader::DownloadError;

    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        #[error(transparent)]
        Config(#[from] ConfigError),
        #[error(transparent)]
        Download(#[from] DownloadError),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);

    match run(args, config).await {
        Ok(()) => {
            info!("download finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "download failed");
            ExitCode::FAILURE
        }
    }
}
