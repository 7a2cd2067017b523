use alloy::primitives::Address;
use anyhow::{
    Context,
    anyhow,
};
use clap::{
    ArgGroup,
    Parser,
};
use deployments::{
    DeploymentEnv,
    DeploymentStore,
};
use keeper::{
    chain::AlloyChain,
    in_flight::{
        DEFAULT_RESUBMIT_AFTER_BLOCKS,
        InFlightTracker,
    },
    indexer_client::{
        IndexerClient,
        default_indexer_url,
    },
    init_tracing,
    scheduler::Scheduler,
    wallets,
};
use std::{
    str::FromStr,
    time::Duration,
};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Sends revealOutcome / rescueExpiredClick for pending Basesweeper clicks",
    long_about = None,
    group(
        ArgGroup::new("network")
            .args(["local", "testnet", "mainnet"])
            .required(true)
    )
)]
struct Args {
    #[arg(short, long)]
    contract_address: Option<String>,

    #[arg(short, long)]
    rpc_url: Option<Url>,

    #[arg(long, default_value_t = default_indexer_url())]
    indexer_url: String,

    /// Ethereum v3 keystore; falls back to SWEEPER_PRIVATE_KEY.
    #[arg(long)]
    keystore: Option<String>,

    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_RESUBMIT_AFTER_BLOCKS)]
    resubmit_after: u64,

    /// Log due actions without sending transactions.
    #[arg(long)]
    dry_run: bool,

    /// Run a single tick and exit.
    #[arg(long)]
    once: bool,

    #[arg(long)]
    local: bool,

    #[arg(long)]
    testnet: bool,

    #[arg(long)]
    mainnet: bool,
}

async fn handle_interupt() {
    let res = tokio::signal::ctrl_c().await;
    match res {
        Ok(_) => {
            tracing::info!("Received interrupt, exiting");
        }
        Err(_) => {
            tracing::warn!("Received interrupt error, exiting anyway");
        }
    }
}

fn parse_contract_address(raw: &str) -> anyhow::Result<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| anyhow!("Failed to parse contract address '{raw}': {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let deployment_env = if args.local {
        DeploymentEnv::Local
    } else if args.testnet {
        DeploymentEnv::Testnet
    } else {
        DeploymentEnv::Mainnet
    };
    let record = DeploymentStore::new(deployment_env)
        .context("opening deployments store")?
        .load_or_builtin()
        .context("loading deployment")?;

    let contract = match (&args.contract_address, &record) {
        (Some(raw), _) => parse_contract_address(raw).context("parsing --contract-address")?,
        (None, Some(record)) => parse_contract_address(&record.contract_address)?,
        (None, None) => {
            return Err(anyhow!(
                "No deployment record found for {deployment_env}; provide --contract-address"
            ));
        }
    };
    let rpc_url = match (&args.rpc_url, &record) {
        (Some(url), _) => url.clone(),
        (None, Some(record)) => Url::parse(&record.network_url)
            .with_context(|| format!("parsing network url {}", record.network_url))?,
        (None, None) => Url::parse(deployment_env.default_rpc_url())
            .context("parsing default rpc url")?,
    };

    let chain = match wallets::load_signer(args.keystore.as_deref())? {
        Some(signer) => {
            tracing::info!("Keeper sending from {}", signer.address());
            AlloyChain::with_signer(rpc_url.clone(), contract, signer)
        }
        None if args.dry_run => AlloyChain::read_only(rpc_url.clone(), contract),
        None => {
            return Err(anyhow!(
                "No signing key: pass --keystore or set {}, or run with --dry-run",
                wallets::PRIVATE_KEY_ENV
            ));
        }
    };
    let indexer = IndexerClient::new(args.indexer_url.clone())?;
    tracing::info!(
        "Watching contract {} on {} through indexer {}",
        contract,
        rpc_url,
        indexer
    );

    let mut scheduler = Scheduler::new(
        chain,
        indexer,
        InFlightTracker::new(args.resubmit_after),
    )
    .dry_run(args.dry_run);

    if args.once {
        let report = scheduler.tick().await?;
        tracing::info!(
            head = report.head,
            outstanding = report.outstanding,
            sent = report.submitted.len(),
            failed = report.failed.len(),
            "Single tick complete"
        );
        return Ok(());
    }

    let mut interval = tokio::time::interval(Duration::from_secs(args.poll_interval_secs.max(1)));
    let interrupt = handle_interupt();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match scheduler.tick().await {
                    Ok(report) if !report.due.is_empty() || !report.resolved.is_empty() => {
                        tracing::info!(
                            head = report.head,
                            outstanding = report.outstanding,
                            resolved = report.resolved.len(),
                            sent = report.submitted.len(),
                            failed = report.failed.len(),
                            "Tick"
                        );
                    }
                    Ok(report) => {
                        tracing::debug!(head = report.head, outstanding = report.outstanding, "Tick");
                    }
                    Err(e) => {
                        tracing::warn!("Tick failed, retrying next interval: {e:#}");
                    }
                }
            }
            _ = &mut interrupt => {
                tracing::info!("Exiting keeper");
                return Ok(());
            }
        }
    }
}
