use log::{info, warn};
use meridian_clock::{Clock, SystemClock};
use meridian_gateway::EnvCredentialStore;
use meridian_nonce::SerializationAuthority;
use meridian_runner::{ExitOnlyStrategy, RunMode, TradingEngine, discover_accounts, load_config};
use std::sync::Arc;

fn print_help() {
    eprintln!(
        r#"Meridian - multi-account execution and risk engine

USAGE:
    meridian --config <PATH> [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Load configuration from JSON file
    --paper                 Trade every account against the paper venue
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    MERIDIAN_<EXCHANGE>_<ROLE>_API_KEY       API key, e.g. MERIDIAN_KRAKEN_MASTER_API_KEY
    MERIDIAN_<EXCHANGE>_<ROLE>_API_SECRET    API secret
    MERIDIAN_<EXCHANGE>_<ROLE>_PASSPHRASE    Passphrase (OKX only)
    RUST_LOG                                 Log level filter (default: info)

EXAMPLES:
    # Live trading
    meridian --config meridian.json

    # Paper trading with the same configuration
    meridian --config meridian.json --paper
"#
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<String> = None;
    let mut force_paper = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--config" | "-c" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
                config_path = Some(args[i].clone());
            }
            "--paper" => force_paper = true,
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let Some(path) = config_path else {
        eprintln!("Error: --config is required");
        print_help();
        std::process::exit(1);
    };

    info!("Loading configuration from: {}", path);
    let mut config = load_config(&path)?;
    if force_paper {
        config.mode = RunMode::Paper;
    }
    config.validate()?;
    info!(
        "Mode: {:?}, {} exchanges, {} accounts, cycle every {}s",
        config.mode,
        config.exchanges.len(),
        config.accounts.len(),
        config.cycle_interval_secs
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let authority = Arc::new(SerializationAuthority::new(clock.clone(), config.nonce.clone()));
    let credentials = EnvCredentialStore::new();

    let discovery = discover_accounts(&config, authority, &credentials, clock.clone()).await?;
    for (account, reason) in &discovery.skipped {
        warn!("Not trading {}: {}", account, reason);
    }

    let engine = TradingEngine::start(&config, discovery.funded, Arc::new(ExitOnlyStrategy), clock)?;
    info!("Trading {} accounts, Ctrl-C to stop", engine.accounts().len());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing current cycles");

    let finals = engine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&finals)?);
    Ok(())
}
