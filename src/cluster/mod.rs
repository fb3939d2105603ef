//! Cluster write pipeline
//!
//! One [`Node`] per downstream peer fronts the streaming RPC surface with
//! rate limiting, WAL failover and background replay. [`Cluster`] keeps the
//! node map and routes batches to the right forwarder.

mod limiter;
mod node;
mod transport;

pub use limiter::RateLimiter;
pub use node::{Node, ReadOutcome};
pub use transport::{GrpcTransport, MetaSink, Transport, WriteStream};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::proto;
use crate::Result;

/// TLS material for peer channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// CA certificate (PEM) the peer certificate must chain to
    pub ca_cert: PathBuf,
    /// Hostname expected in the peer certificate
    pub domain_name: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Requests per second towards one peer; writes get 90% of it, reads and
    /// meta exchanges 10% each
    pub grpc_max_server_conn: u32,
    /// Burst allowance shared by the three limiters
    pub grpc_burst_server_conn: u32,
    /// Default per-request deadline
    pub grpc_timeout: Duration,
    /// Root directory for the per-peer replay logs
    pub log_path: PathBuf,
    /// Optional TLS for peer channels; plaintext when absent
    pub tls: Option<TlsSettings>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            grpc_max_server_conn: 100,
            grpc_burst_server_conn: 10,
            grpc_timeout: Duration::from_secs(10),
            log_path: PathBuf::from("data/replay"),
            tls: None,
        }
    }
}

/// Forwarders for every known peer, created lazily per address
pub struct Cluster {
    settings: ClusterSettings,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
}

impl Cluster {
    /// Create an empty cluster
    pub fn new(settings: ClusterSettings) -> Self {
        Self {
            settings,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Get the forwarder for `address:port`, connecting it on first use
    pub fn node(&self, address: &str, port: u16) -> Result<Arc<Node>> {
        if let Some(node) = self.nodes.read().get(address) {
            return Ok(node.clone());
        }

        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get(address) {
            return Ok(node.clone());
        }

        let transport = Arc::new(GrpcTransport::connect(
            address,
            port,
            self.settings.tls.as_ref(),
        )?);
        let node = Node::new(address, port, self.settings.clone(), transport)?;
        nodes.insert(address.to_string(), node.clone());

        Ok(node)
    }

    /// Forward a batch to one peer, spilling to its replay log on failure
    pub async fn write_points(
        &self,
        address: &str,
        port: u16,
        pts: Vec<proto::Point>,
    ) -> Result<()> {
        self.node(address, port)?.write(pts).await
    }

    /// Shut down every forwarder
    pub fn close(&self) {
        for node in self.nodes.read().values() {
            node.close();
        }
        info!("cluster closed");
    }
}
