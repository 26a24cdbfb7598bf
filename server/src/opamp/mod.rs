//! OpAMP configuration coordinator.
//!
//! Tracks connected collector agents, delivers queued effective-config
//! updates over the OpAMP WebSocket, and exposes a REST facade for
//! operators.

pub mod proto;
pub mod registry;
pub mod rest;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

pub use registry::AgentRegistry;

/// How often agent state is swept for TTL expiry and stale deliveries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Start the periodic registry sweep.
pub fn spawn_sweeper(registry: Arc<AgentRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            registry.sweep();
        }
    })
}
