use alloy::{
    primitives::{
        Address,
        U256,
    },
    providers::{
        Provider,
        ProviderBuilder,
    },
};
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
    DeploymentRecord,
    DeploymentStore,
};
use indexer::app::{
    App,
    RunState,
    actix_query_api::{
        ActixQueryApi,
        DEFAULT_QUERY_PORT,
    },
    event_source::SpawnedEventSource,
    init_tracing,
    projection_storage::ProjectionStorage,
    rpc_event_source::{
        AlloyLogProvider,
        DEFAULT_RANGE_SIZE,
        EventSourceConfig,
        RpcEventSource,
    },
    sled_storage::SledProjectionStorage,
};
use std::{
    env::current_dir,
    fs,
    path::PathBuf,
    str::FromStr,
};
use sweeper_abi::{
    DEFAULT_CLICK_FEE_WEI,
    contract_instance,
};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    version,
    about,
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

    #[arg(long = "start-block")]
    start_block: Option<u64>,

    #[arg(short, long, default_value_t = DEFAULT_QUERY_PORT)]
    port: u16,

    #[arg(short, long, default_value = "false")]
    tracing: bool,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Drop the stored projection and replay from the deployment block.
    #[arg(long)]
    reindex: bool,

    #[arg(long, default_value_t = DEFAULT_RANGE_SIZE)]
    range_size: u64,

    #[arg(long, default_value_t = 0)]
    confirmations: u64,

    #[arg(long)]
    click_fee_wei: Option<u128>,

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
    let args = Args::parse();
    if args.tracing {
        init_tracing();
    }
    let deployment_env = if args.local {
        DeploymentEnv::Local
    } else if args.testnet {
        DeploymentEnv::Testnet
    } else {
        DeploymentEnv::Mainnet
    };
    let store =
        DeploymentStore::new(deployment_env).context("opening deployments store")?;
    let stored_record = store.load_or_builtin().context("loading deployment")?;
    let cli_contract = args
        .contract_address
        .as_deref()
        .map(parse_contract_address)
        .transpose()
        .context("parsing --contract-address")?;

    let matches_cli_contract = |record: &DeploymentRecord, address: &Address| {
        parse_contract_address(&record.contract_address)
            .map(|parsed| parsed == *address)
            .unwrap_or(false)
    };
    let record_used = match (&cli_contract, stored_record) {
        (Some(address), Some(record)) if matches_cli_contract(&record, address) => {
            Some(record)
        }
        (None, record) => record,
        _ => None,
    };
    let contract = match (&record_used, cli_contract) {
        (Some(record), _) => parse_contract_address(&record.contract_address)
            .with_context(|| {
                format!(
                    "parsing contract address from deployment record {}",
                    record.contract_address
                )
            })?,
        (None, Some(address)) => address,
        (None, None) => {
            return Err(anyhow!(
                "No deployment record found for {deployment_env}; provide --contract-address"
            ));
        }
    };
    let rpc_url = match (&args.rpc_url, &record_used) {
        (Some(url), _) => url.clone(),
        (None, Some(record)) => Url::parse(&record.network_url)
            .with_context(|| format!("parsing network url {}", record.network_url))?,
        (None, None) => Url::parse(deployment_env.default_rpc_url())
            .context("parsing default rpc url")?,
    };
    let deployment_block = match (args.start_block, &record_used) {
        (Some(block), _) => block,
        (None, Some(record)) => record.deployment_block.unwrap_or_else(|| {
            tracing::warn!(
                "Deployment record {} missing deployment_block; defaulting to 0",
                record.contract_address
            );
            0
        }),
        (None, None) => {
            return Err(anyhow!(
                "No deployment metadata available for contract {contract}; supply --start-block"
            ));
        }
    };

    let provider = ProviderBuilder::new().connect_http(rpc_url.clone()).erased();
    if record_used.is_none() {
        let chain_id = provider.get_chain_id().await.ok();
        store
            .save(deployments::new_record(
                contract.to_string(),
                rpc_url.as_str(),
                chain_id,
                Some(deployment_block),
            ))
            .context("recording deployment")?;
        tracing::info!("Recorded deployment {} for {}", contract, deployment_env);
    } else {
        tracing::info!(
            "Using contract {} on {} from block {}",
            contract,
            rpc_url,
            deployment_block
        );
    }

    let click_fee = match args.click_fee_wei {
        Some(fee) => U256::from(fee),
        None => match contract_instance(contract, provider.clone()).FEE().call().await {
            Ok(fee) => fee,
            Err(e) => {
                tracing::warn!("FEE() call failed, using built-in fee: {e}");
                U256::from(DEFAULT_CLICK_FEE_WEI)
            }
        },
    };
    tracing::info!("Per-click fee: {} wei", click_fee);

    let data_root = match &args.data_dir {
        Some(path) => path.clone(),
        None => current_dir()
            .context("determine process working directory")?
            .join("sweeper_indexer_data")
            .join(deployment_env.dir_name())
            .join(contract.to_string().to_lowercase()),
    };
    fs::create_dir_all(&data_root)?;
    tracing::info!("Using sled storage directory: {}", data_root.display());

    let mut storage = SledProjectionStorage::open(&data_root)?;
    if args.reindex {
        tracing::info!("Reindexing from block {}", deployment_block);
        storage.reset()?;
    }
    let start_block = match storage.checkpoint()? {
        Some(checkpoint) => {
            tracing::info!(
                "Found indexed state up to block {}; resuming at {}",
                checkpoint,
                checkpoint + 1
            );
            checkpoint + 1
        }
        None => {
            tracing::info!("Indexer will start from block {}", deployment_block);
            deployment_block
        }
    };

    let config = EventSourceConfig {
        range_size: args.range_size,
        confirmations: args.confirmations,
        ..EventSourceConfig::default()
    };
    let events = SpawnedEventSource::spawn(RpcEventSource::new(
        AlloyLogProvider::new(provider, contract),
        start_block,
        config,
    ));
    let api = ActixQueryApi::new(Some(args.port)).await?;
    let mut app = App::new(events, api, storage, click_fee)?;

    tracing::info!("Starting indexer service");
    loop {
        let interrupt = handle_interupt();
        match app.run(interrupt).await? {
            RunState::Continue => continue,
            RunState::Exit => {
                tracing::info!("Exiting indexer service");
                return Ok(());
            }
        }
    }
}
