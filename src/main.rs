use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use chainscribe::blob_store::FileBlobStore;
use chainscribe::block_repo::{NodeBlockRepository, StoreBlockRepository};
use chainscribe::bulk::{BulkIndexer, BulkIndexerConfig};
use chainscribe::checkpoint::CheckpointStore;
use chainscribe::config::{
    get_block_granularity, get_blob_path, get_db_path, get_global_config, get_network,
    get_node_endpoint, get_transactions_per_work, get_workers, init_global_config, Config,
};
use chainscribe::events::EventBroadcaster;
use chainscribe::header_chain::HeaderChain;
use chainscribe::index_wallets;
use chainscribe::listener::LiveListener;
use chainscribe::metrics::init_metrics;
use chainscribe::peer::{synchronize_headers, NodesGroup, Peer};
use chainscribe::store::IndexStore;
use chainscribe::telemetry::{init_tracing, TelemetryConfig};
use chainscribe::types::{
    QUEUE_BROADCASTED_TRANSACTIONS, QUEUE_INITIAL_INDEXING, QUEUE_NEW_BLOCK, QUEUE_NEW_TRANSACTION,
};
use chainscribe::work_queue::PersistentQueue;

#[derive(Parser)]
#[command(name = "chainscribe", about = "Blockchain secondary-index maintainer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill the indexes from genesis to the current tip
    Bulk,
    /// Follow the p2p stream and keep the indexes current
    Listen,
    /// Bulk backfill, then hand off to the live listener
    Run,
    /// Attach an address to a wallet label for the wallet index
    AddWalletRule { label: String, address: String },
}

struct App {
    store: Arc<IndexStore>,
    blobs: Arc<FileBlobStore>,
    chain: Arc<HeaderChain>,
    checkpoints: Arc<CheckpointStore>,
    block_cache: Arc<StoreBlockRepository>,
}

impl App {
    fn build(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let store = Arc::new(IndexStore::open(get_db_path(config)?)?);
        let blobs = Arc::new(FileBlobStore::new(get_blob_path(config)?)?);
        let chain = Arc::new(HeaderChain::new(get_network(config)?));
        let checkpoints = Arc::new(CheckpointStore::new(Arc::clone(&blobs)));
        let block_cache = Arc::new(StoreBlockRepository::new(Arc::clone(&blobs), 64));
        Ok(Self {
            store,
            blobs,
            chain,
            checkpoints,
            block_cache,
        })
    }
}

async fn connect_peers(
    config: &Config,
    app: &App,
) -> Result<(Arc<NodesGroup>, Arc<Peer>), Box<dyn std::error::Error>> {
    let network = get_network(config)?;
    let mut endpoints = vec![get_node_endpoint(config)?];
    if let Ok(extra) = config.get_array("node.extra_endpoints") {
        for value in extra {
            endpoints.push(value.into_string()?);
        }
    }

    let group = Arc::new(NodesGroup::new());
    let mut primary = None;
    for endpoint in endpoints {
        let addr: SocketAddr = tokio::net::lookup_host(&endpoint)
            .await?
            .next()
            .ok_or_else(|| format!("cannot resolve {}", endpoint))?;
        match Peer::connect(addr, network).await {
            Ok(peer) => {
                peer.handshake(app.chain.height() as i32).await?;
                group.add(Arc::clone(&peer));
                primary.get_or_insert(peer);
            }
            Err(e) => error!(%endpoint, "peer connection failed: {}", e),
        }
    }

    let primary = primary.ok_or("no peer could be connected")?;
    Ok((group, primary))
}

async fn run_bulk(config: &Config, app: &App) -> Result<usize, Box<dyn std::error::Error>> {
    let (_group, peer) = connect_peers(config, app).await?;
    synchronize_headers(&peer, &app.chain).await?;
    info!(height = app.chain.height(), "header chain synchronized");

    let repository = Arc::new(NodeBlockRepository::new(
        Arc::clone(&peer),
        Some(Arc::clone(&app.block_cache)),
    ));
    let queue = Arc::new(PersistentQueue::new(
        Arc::clone(&app.store),
        QUEUE_INITIAL_INDEXING,
        Duration::from_secs(120),
    ));
    let indexer = BulkIndexer::new(
        Arc::clone(&app.chain),
        repository,
        Arc::clone(&app.store),
        Arc::clone(&app.blobs),
        Arc::clone(&app.checkpoints),
        queue,
        BulkIndexerConfig {
            block_granularity: get_block_granularity(config),
            transactions_per_work: get_transactions_per_work(config),
            workers: get_workers(config),
        },
    );

    let processed = indexer.run().await?;
    info!(processed, "bulk indexing finished");
    Ok(processed)
}

async fn run_listen(config: &Config, app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let (group, peer) = connect_peers(config, app).await?;

    let broadcast_queue = Arc::new(PersistentQueue::new(
        Arc::clone(&app.store),
        QUEUE_BROADCASTED_TRANSACTIONS,
        Duration::from_secs(600),
    ));
    let new_tx_topic = Arc::new(PersistentQueue::new(
        Arc::clone(&app.store),
        QUEUE_NEW_TRANSACTION,
        Duration::from_secs(60),
    ));
    let new_block_topic = Arc::new(PersistentQueue::new(
        Arc::clone(&app.store),
        QUEUE_NEW_BLOCK,
        Duration::from_secs(60),
    ));

    let listener = Arc::new(LiveListener::new(
        Arc::clone(&app.chain),
        Arc::clone(&app.store),
        Arc::clone(&app.checkpoints),
        Arc::clone(&app.block_cache),
        group,
        Arc::new(EventBroadcaster::new()),
        broadcast_queue,
        new_tx_topic,
        new_block_topic,
    ));

    let cancel = listener.cancel_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        cancel.cancel();
    });

    let run_result = listener.run(Arc::clone(&peer)).await;
    peer.disconnect().await;
    let dispose_result = listener.dispose().await;
    run_result?;
    dispose_result?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_global_config()?;
    init_tracing(TelemetryConfig::default())?;
    init_metrics()?;

    let config = get_global_config();
    let cli = Cli::parse();
    let app = App::build(config)?;

    match cli.command {
        Commands::Bulk => {
            run_bulk(config, &app).await?;
        }
        Commands::Listen => {
            run_listen(config, &app).await?;
        }
        Commands::Run => {
            run_bulk(config, &app).await?;
            run_listen(config, &app).await?;
        }
        Commands::AddWalletRule { label, address } => {
            index_wallets::add_rule_for_address(
                &app.store,
                &label,
                &address,
                get_network(config)?,
            )?;
            info!(%label, %address, "wallet rule stored");
        }
    }

    Ok(())
}
