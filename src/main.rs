use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use ledgerguard::adapter::{Action, PaperAdapter};
use ledgerguard::audit::{
    generate_signing_key, load_signing_key, read_records, save_signing_key, verify_records,
};
use ledgerguard::config::Config;
use ledgerguard::drp::load_bundle;
use ledgerguard::session::{SessionController, SessionOptions};
use ledgerguard::state::StateDelta;

/// LedgerGuard - session state and disaster recovery core for trading engines
#[derive(Parser, Debug)]
#[command(name = "ledgerguard", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a paper-trading session until interrupted
    Run {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Strategy label when no config file is given
        #[arg(short, long, default_value = "paper")]
        strategy: String,
    },
    /// Generate a session signing key pair
    Keygen {
        /// Where to write the key (public key lands alongside as .pub)
        #[arg(short, long, default_value = "data/signing.key")]
        out: PathBuf,
    },
    /// Verify an audit log offline against a public key
    VerifyAudit {
        /// Path to the audit JSONL file
        #[arg(short, long)]
        log: PathBuf,

        /// Hex-encoded Ed25519 public key
        #[arg(short, long)]
        pubkey: String,
    },
    /// Print a snapshot bundle's metadata after checking its integrity
    ShowSnapshot {
        /// Path to the bundle file
        #[arg(short, long)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run { config, strategy } => run(config, &strategy).await,
        Command::Keygen { out } => keygen(&out),
        Command::VerifyAudit { log, pubkey } => verify_audit(&log, &pubkey),
        Command::ShowSnapshot { path } => show_snapshot(&path),
    }
}

async fn run(config_path: Option<PathBuf>, strategy: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default_local(strategy),
    };

    std::fs::create_dir_all(&config.data_dir)?;
    let key_path = config.signing_key_path();
    let signing_key = if key_path.exists() {
        load_signing_key(&key_path)?
    } else {
        let key = generate_signing_key();
        save_signing_key(&key_path, &key)?;
        info!(path = %key_path.display(), "generated session signing key");
        key
    };

    let mut options = SessionOptions::new(&config.strategy, config.initial_capital.clone());
    options.session_id = config.session_id.clone();
    options.approval_required = config.governance.approval_required;
    options.max_transaction_retries = config.session.max_transaction_retries;
    options.idempotency_timeout = Duration::from_secs(config.session.idempotency_timeout_secs);
    options.effect_timeout = Duration::from_secs(config.session.effect_timeout_secs);
    options.snapshot_dir = Some(config.snapshot_dir());

    let adapter = Arc::new(PaperAdapter::new());
    let controller = SessionController::open(options, signing_key, &config.data_dir, adapter)?;

    info!(
        session_id = %config.session_id,
        strategy = %config.strategy,
        "session running, ctrl-c to halt"
    );

    let mut heartbeat = tokio::time::interval(Duration::from_secs(config.session.heartbeat_secs));
    heartbeat.tick().await; // fires immediately
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                tick += 1;
                // One small paper action per heartbeat to exercise the books.
                let action = Action {
                    idempotency_key: format!("{}-tick-{tick}", config.session_id),
                    description: "paper probe trade".to_string(),
                    payload: serde_json::json!({ "tick": tick }),
                    delta: StateDelta::capital_change("USDC", dec!(-1)),
                };
                match controller.execute(action).await {
                    Ok(report) => info!(version = report.version, receipt = %report.receipt.reference, "tick committed"),
                    Err(e) => warn!(error = %e, "tick refused"),
                }
                let metrics = controller.metrics();
                info!(
                    committed = metrics.actions_committed,
                    failed = metrics.actions_failed,
                    head = controller.store().head_version(),
                    "heartbeat"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, halting session");
                if let Err(e) = controller.halt("operator interrupt") {
                    error!(error = %e, "halt failed");
                }
                break;
            }
        }
    }

    let metrics = controller.metrics();
    info!(
        committed = metrics.actions_committed,
        snapshots = metrics.snapshots_taken,
        "session halted"
    );
    Ok(())
}

fn keygen(out: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let key = generate_signing_key();
    save_signing_key(out, &key)?;
    println!("signing key: {}", out.display());
    println!("public key:  {}", hex::encode(key.verifying_key().to_bytes()));
    Ok(())
}

fn verify_audit(log: &PathBuf, pubkey: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = hex::decode(pubkey)?;
    let raw: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| "public key must be 32 bytes")?;
    let key = ed25519_dalek::VerifyingKey::from_bytes(&raw)?;

    let records = read_records(log)?;
    verify_records(&key, &records)?;
    println!("ok: {} records, chain intact", records.len());
    Ok(())
}

fn show_snapshot(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let bundle = load_bundle(path)?;
    println!("{}", serde_json::to_string_pretty(&bundle.meta)?);
    Ok(())
}
