/// Metrics - Prometheus instrumentation
///
/// Registry plus the counters and gauges that matter operationally:
/// ingest throughput, queue activity, broadcast outcomes, chain tip.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total blocks written to the block index, by ingest path
    /// Labels: path (bulk, live)
    pub static ref BLOCKS_INDEXED: IntCounterVec = IntCounterVec::new(
        Opts::new("chainscribe_blocks_indexed_total", "Blocks written to the block index by ingest path"),
        &["path"]
    ).unwrap();

    /// Total transactions written to the transaction index, by ingest path
    pub static ref TRANSACTIONS_INDEXED: IntCounterVec = IntCounterVec::new(
        Opts::new("chainscribe_transactions_indexed_total", "Transactions written to the transaction index by ingest path"),
        &["path"]
    ).unwrap();

    /// Block ranges processed by the bulk dequeue loop
    pub static ref RANGES_PROCESSED: IntCounter = IntCounter::new(
        "chainscribe_ranges_processed_total",
        "Block ranges dequeued and completed by the bulk indexer"
    ).unwrap();

    /// Block ranges abandoned because the chain reorged past their start
    pub static ref RANGES_ABANDONED: IntCounter = IntCounter::new(
        "chainscribe_ranges_abandoned_total",
        "Block ranges abandoned after a reorg deeper than the range start"
    ).unwrap();

    /// Transactions handed to peers via inv broadcast
    pub static ref TRANSACTIONS_BROADCAST: IntCounter = IntCounter::new(
        "chainscribe_transactions_broadcast_total",
        "Outbound transactions announced to peers"
    ).unwrap();

    /// Broadcasts suppressed by a persisted reject record
    pub static ref BROADCASTS_REJECT_SUPPRESSED: IntCounter = IntCounter::new(
        "chainscribe_broadcasts_reject_suppressed_total",
        "Broadcast attempts short-circuited by a reject record"
    ).unwrap();

    /// Height of the header chain tip
    pub static ref CHAIN_TIP_HEIGHT: IntGauge = IntGauge::new(
        "chainscribe_chain_tip_height",
        "Height of the in-memory header chain tip"
    ).unwrap();

    /// Connected peer count
    pub static ref PEERS_CONNECTED: IntGauge = IntGauge::new(
        "chainscribe_peers_connected",
        "Currently connected peers"
    ).unwrap();

    /// Chain reorganizations observed by the live listener
    pub static ref REORG_EVENTS: IntCounter = IntCounter::new(
        "chainscribe_reorg_events_total",
        "Header chain re-anchoring events"
    ).unwrap();
}

pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(BLOCKS_INDEXED.clone()))?;
    REGISTRY.register(Box::new(TRANSACTIONS_INDEXED.clone()))?;
    REGISTRY.register(Box::new(RANGES_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(RANGES_ABANDONED.clone()))?;
    REGISTRY.register(Box::new(TRANSACTIONS_BROADCAST.clone()))?;
    REGISTRY.register(Box::new(BROADCASTS_REJECT_SUPPRESSED.clone()))?;
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(PEERS_CONNECTED.clone()))?;
    REGISTRY.register(Box::new(REORG_EVENTS.clone()))?;
    Ok(())
}

/// Gather metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
