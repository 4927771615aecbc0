use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use cpra::config::AppConfig;
use cpra::diagnostics::DEFAULT_ADDR;
use cpra::logging::init_logging;
use cpra::runtime::{self, Options, RuntimeError};
use cpra::version::VERSION;

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Endpoint monitor with automated remediation", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Monitor manifest (.yaml, .yml or .json); overrides CPRA_MANIFEST
    #[arg(long)]
    yaml: Option<PathBuf>,

    /// Log at debug level unless CPRA_LOG says otherwise
    #[arg(long)]
    debug: bool,

    /// Serve /debug/stats and /debug/health
    #[arg(long)]
    pprof: bool,

    #[arg(long = "pprof.addr", default_value = DEFAULT_ADDR)]
    pprof_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cpra: {e}");
            return ExitCode::from(RuntimeError::from(e).exit_code());
        }
    };
    let _guard = match init_logging(&config.logging, args.debug) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("cpra: {e}");
            return ExitCode::from(RuntimeError::from(e).exit_code());
        }
    };
    info!("Starting cpra, version: {}", VERSION);

    let options = Options {
        manifest: args.yaml,
        diagnostics: args.pprof.then_some(args.pprof_addr),
    };
    match runtime::run(config, options).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
