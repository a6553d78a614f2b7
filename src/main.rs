use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use shoal::commands::run::{self, RunOptions};
use shoal::logging::{self, LogFormat};

/// Zero-downtime process cluster for HTTP workers.
#[derive(Parser)]
#[command(name = "shoal", version, about)]
struct Cli {
    /// Number of workers (0 = one per CPU, minus one)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Port every worker listens on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address every worker binds to
    #[arg(long)]
    host: Option<String>,

    /// Config file (default: ./shoal.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "SHOAL_LOG_FORMAT")]
    log_format: LogFormat,

    /// Delay every demo response by this many milliseconds
    #[arg(long, value_name = "MS")]
    delay_ms: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let options = RunOptions {
        workers: cli.workers,
        host: cli.host,
        port: cli.port,
        config: cli.config,
        delay: cli.delay_ms.map(Duration::from_millis),
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            std::process::exit(1);
        },
    };

    // Exit without dropping the runtime: a worker's blocking stdin reader
    // would otherwise keep the process alive.
    let code = match runtime.block_on(run::execute(options)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            1
        },
    };
    std::process::exit(code);
}
