//! RPC contracts between the cluster manager, the media agents and their callers.

use crate::allocator::AllocatedWorker;
use crate::load_report::WorkerKind;

use gora_mq::{RpcClient, RpcError};
use serde_json::{json, Value};
use std::sync::Arc;

/// Queue served by the cluster manager.
pub const CLUSTER_MANAGER_RPC_SERVER_NAME: &str = "rpc.cm";

/// `allocMedia(callerId, workerKind) -> {groupName, workerId}`
pub const METHOD_ALLOC_MEDIA: &str = "allocMedia";
/// `allocPortal() -> portal address`
pub const METHOD_ALLOC_PORTAL: &str = "allocPortal";
/// `getRouterCapabilities(workerId, callerId?) -> capability descriptor`,
/// served by each media agent on the queue named after its group
pub const METHOD_GET_ROUTER_CAPABILITIES: &str = "getRouterCapabilities";

/// Typed caller side of the cluster manager and media agent contracts.
#[derive(Debug, Clone)]
pub struct ClusterManagerClient {
    rpc: Arc<RpcClient>,
    server: String,
}

impl ClusterManagerClient {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self::with_server(rpc, CLUSTER_MANAGER_RPC_SERVER_NAME)
    }

    pub fn with_server(rpc: Arc<RpcClient>, server: impl Into<String>) -> Self {
        ClusterManagerClient {
            rpc,
            server: server.into(),
        }
    }

    pub async fn alloc_media(
        &self,
        caller_id: &str,
        kind: WorkerKind,
    ) -> Result<AllocatedWorker, RpcError> {
        self.rpc
            .call(&self.server, METHOD_ALLOC_MEDIA, vec![json!(caller_id), json!(kind)])
            .await
    }

    pub async fn alloc_portal(&self) -> Result<String, RpcError> {
        self.rpc.call(&self.server, METHOD_ALLOC_PORTAL, vec![]).await
    }

    /// Asks the agent of `worker.group_name` for the capabilities of the
    /// allocated worker, on behalf of `caller_id`.
    pub async fn router_capabilities(
        &self,
        worker: &AllocatedWorker,
        caller_id: &str,
    ) -> Result<Value, RpcError> {
        self.rpc
            .call(
                &worker.group_name,
                METHOD_GET_ROUTER_CAPABILITIES,
                vec![json!(worker.worker_id), json!(caller_id)],
            )
            .await
    }
}
