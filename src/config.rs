pub use config::Config;
pub use once_cell::sync::OnceCell;
use std::error::Error;

use bitcoin::Network;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config() -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name("config.toml"))
        .build()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

pub fn get_db_path(config: &Config) -> Result<String, Box<dyn Error>> {
    config
        .get_string("paths.db_path")
        .map_err(|e| format!("Missing paths.db_path in config: {}", e).into())
}

pub fn get_blob_path(config: &Config) -> Result<String, Box<dyn Error>> {
    config
        .get_string("paths.blob_path")
        .map_err(|e| format!("Missing paths.blob_path in config: {}", e).into())
}

/// `network` option: mainnet | testnet | regtest
pub fn get_network(config: &Config) -> Result<Network, Box<dyn Error>> {
    match config
        .get_string("network")
        .unwrap_or_else(|_| "mainnet".to_string())
        .as_str()
    {
        "mainnet" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "regtest" => Ok(Network::Regtest),
        other => Err(format!("Unknown network '{}'", other).into()),
    }
}

/// `node.endpoint` option: host:port of the peer the indexer connects to
pub fn get_node_endpoint(config: &Config) -> Result<String, Box<dyn Error>> {
    config
        .get_string("node.endpoint")
        .map_err(|e| format!("Missing node.endpoint in config: {}", e).into())
}

pub fn get_block_granularity(config: &Config) -> u32 {
    config.get_int("indexer.block_granularity").unwrap_or(100) as u32
}

pub fn get_transactions_per_work(config: &Config) -> u32 {
    config
        .get_int("indexer.transactions_per_work")
        .unwrap_or(2_000_000) as u32
}

pub fn get_workers(config: &Config) -> usize {
    config.get_int("indexer.workers").unwrap_or(4) as usize
}
