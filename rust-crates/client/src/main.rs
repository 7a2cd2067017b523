use alloy::primitives::{
    Address,
    utils::format_ether,
};
use clap::{
    ArgGroup,
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::{
    DeploymentEnv,
    DeploymentStore,
};
use indexer::app::{
    RunState,
    event_source::SpawnedEventSource,
    rpc_event_source::{
        AlloyLogProvider,
        EventSourceConfig,
        RpcEventSource,
    },
};
use keeper::{
    chain::{
        AlloyChain,
        RevealSubmitter,
    },
    in_flight::InFlightTracker,
    indexer_client::{
        IndexerClient,
        PendingSource,
        default_indexer_url,
    },
    wallets,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
    time::Duration,
};
use sweeper_client::{
    board::render_board,
    board_reader::read_current_game,
    cache::ClientStateCache,
    watcher::{
        DEFAULT_RECONCILE_INTERVAL,
        TAIL_LOOKBACK_BLOCKS,
        Watcher,
    },
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Terminal client for Basesweeper",
    long_about = None,
    group(
        ArgGroup::new("network")
            .args(["local", "testnet", "mainnet"])
            .required(true)
    )
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, global = true)]
    contract_address: Option<String>,

    #[arg(short, long, global = true)]
    rpc_url: Option<Url>,

    #[arg(long, global = true, default_value_t = default_indexer_url())]
    indexer_url: String,

    /// Ethereum v3 keystore; falls back to SWEEPER_PRIVATE_KEY.
    #[arg(long, global = true)]
    keystore: Option<String>,

    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    local: bool,

    #[arg(long)]
    testnet: bool,

    #[arg(long)]
    mainnet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the live game, revealing and rescuing due clicks.
    Watch {
        /// Only display; never send reveal or rescue transactions.
        #[arg(long)]
        no_reveal: bool,

        #[arg(long, default_value_t = DEFAULT_RECONCILE_INTERVAL.as_secs())]
        reconcile_secs: u64,
    },
    /// Pay the fee and click a tile.
    Click { tile: u8 },
    /// Print the current board once.
    Board,
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

fn init_file_tracing(dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(dir)
        .wrap_err_with(|| format!("creating log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, "sweeper.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(guard)
}

fn parse_contract_address(raw: &str) -> Result<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| eyre!("Failed to parse contract address '{raw}': {e}"))
}

fn resolve_target(cli: &Cli) -> Result<(Address, Url)> {
    let deployment_env = if cli.local {
        DeploymentEnv::Local
    } else if cli.testnet {
        DeploymentEnv::Testnet
    } else {
        DeploymentEnv::Mainnet
    };
    let record = DeploymentStore::new(deployment_env)
        .and_then(|store| store.load_or_builtin())
        .map_err(|e| eyre!(e))
        .wrap_err("loading deployment")?;
    let contract = match (&cli.contract_address, &record) {
        (Some(raw), _) => parse_contract_address(raw)?,
        (None, Some(record)) => parse_contract_address(&record.contract_address)?,
        (None, None) => {
            return Err(eyre!(
                "No deployment record found for {deployment_env}; provide --contract-address"
            ));
        }
    };
    let rpc_url = match (&cli.rpc_url, &record) {
        (Some(url), _) => url.clone(),
        (None, Some(record)) => Url::parse(&record.network_url)
            .wrap_err_with(|| format!("parsing network url {}", record.network_url))?,
        (None, None) => {
            Url::parse(deployment_env.default_rpc_url()).wrap_err("parsing default rpc url")?
        }
    };
    Ok((contract, rpc_url))
}

/// Board from chain state plus the indexer's pending view, without the event tail.
async fn snapshot(
    chain: &AlloyChain,
    indexer: &IndexerClient,
) -> Result<(ClientStateCache, u64, bool)> {
    let mut cache = ClientStateCache::default();
    let head = chain.head_block().await.map_err(|e| eyre!(e))?;
    let game = read_current_game(chain).await.map_err(|e| eyre!(e))?;
    cache.reconcile_chain_state(&game);
    let history_available = match indexer.pending_set().await {
        Ok(projected) => {
            cache.reconcile_projected(&projected).map_err(|e| eyre!(e))?;
            true
        }
        Err(e) => {
            tracing::warn!("indexer unavailable: {e:#}");
            false
        }
    };
    Ok((cache, head, history_available))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    deployments::ensure_structure().map_err(|e| eyre!(e))?;
    let cli = Cli::parse();
    let log_dir = match &cli.log_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()
            .wrap_err("determine process working directory")?
            .join("sweeper_client_data")
            .join("logs"),
    };
    let _log_guard = init_file_tracing(&log_dir)?;
    tracing::info!("starting sweeper client");

    let (contract, rpc_url) = resolve_target(&cli)?;
    let signer = wallets::load_signer(cli.keystore.as_deref()).map_err(|e| eyre!(e))?;
    let chain = match signer {
        Some(signer) => {
            println!("playing as {}", signer.address());
            AlloyChain::with_signer(rpc_url.clone(), contract, signer)
        }
        None => AlloyChain::read_only(rpc_url.clone(), contract),
    };
    let indexer = IndexerClient::new(cli.indexer_url.clone()).map_err(|e| eyre!(e))?;

    match cli.command {
        Command::Board => {
            let (cache, head, history_available) = snapshot(&chain, &indexer).await?;
            print!("{}", render_board(&cache, head, history_available));
            Ok(())
        }
        Command::Click { tile } => {
            if chain.sender().is_none() {
                return Err(eyre!(
                    "clicking needs a signing key: pass --keystore or set {}",
                    wallets::PRIVATE_KEY_ENV
                ));
            }
            let (cache, _, _) = snapshot(&chain, &indexer).await?;
            if let Some(blocker) = cache.click_blocker(tile) {
                return Err(eyre!("cannot click tile {tile}: {blocker}"));
            }
            let fee = chain.fee().await.map_err(|e| eyre!(e))?;
            let tx_hash = chain.click(tile, fee).await.map_err(|e| eyre!(e))?;
            println!(
                "click on tile {tile} sent for {} ETH: {tx_hash}",
                format_ether(fee)
            );
            println!("run `sweeper watch` to follow the reveal");
            Ok(())
        }
        Command::Watch {
            no_reveal,
            reconcile_secs,
        } => {
            let sending = chain.sender().is_some() && !no_reveal;
            if !sending {
                println!("read-only: reveals and rescues are left to other actors");
            }
            let head = chain.head_block().await.map_err(|e| eyre!(e))?;
            let events = SpawnedEventSource::spawn(RpcEventSource::new(
                AlloyLogProvider::new(chain.provider().clone(), contract),
                head.saturating_sub(TAIL_LOOKBACK_BLOCKS),
                EventSourceConfig::default(),
            ));
            let mut watcher = Watcher::new(
                events,
                chain,
                indexer,
                ClientStateCache::new(InFlightTracker::default()),
                Duration::from_secs(reconcile_secs.max(1)),
            )
            .send_transactions(sending);
            watcher.reconcile_pass().await;

            loop {
                if let Some(frame) = watcher.take_frame() {
                    println!("{frame}");
                }
                match watcher.run(handle_interupt()).await.map_err(|e| eyre!(e))? {
                    RunState::Continue => continue,
                    RunState::Exit => return Ok(()),
                }
            }
        }
    }
}
