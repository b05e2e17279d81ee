use crate::allocator::Allocator;
use crate::config::LoadManagerConfig;
use crate::errors::Result;
use crate::load_report::WorkerKind;
use crate::rpc::{METHOD_ALLOC_MEDIA, METHOD_ALLOC_PORTAL};
use crate::tracker::ClusterLoadTracker;

use gora_mq::{BrokerConnection, HandlerError, RpcArgs, RpcMethods, RpcServer, TopicClient};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, info_span, Instrument};

/// The cluster manager service: keeps the load table fed from the load topic
/// and serves allocation requests on its RPC queue.
pub struct ClusterManager {
    config: LoadManagerConfig,
    tracker: ClusterLoadTracker,
    allocator: Arc<Allocator>,
    topic: Arc<TopicClient>,
    server: RpcServer,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterManager {
    /// Subscribes `topic` to the load reports of every group, starts
    /// consuming them and opens the `config.rpc_server_name` queue.
    pub async fn start(
        conn: Arc<BrokerConnection>,
        topic: Arc<TopicClient>,
        config: LoadManagerConfig,
    ) -> Result<ClusterManager> {
        config.validate()?;
        let span = info_span!("cluster_manager", rpc = %config.rpc_server_name);

        let tracker = ClusterLoadTracker::new(config.stale_after());
        let mut tasks = Vec::new();

        let feed = tracker
            .subscribe(&topic, &config.load_topic_pattern())
            .instrument(span.clone())
            .await?;
        tasks.push(feed);
        topic.start().await?;

        if let Some(window) = config.stale_after() {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(
                async move {
                    let mut interval = time::interval(window);
                    loop {
                        interval.tick().await;
                        let evicted = tracker.prune_stale().await;
                        if !evicted.is_empty() {
                            debug!(groups = ?evicted, "pruned stale load reports");
                        }
                    }
                }
                .instrument(span.clone()),
            ));
        }

        let allocator = Arc::new(Allocator::new(tracker.clone(), &config));
        let server = RpcServer::builder(
            conn,
            config.rpc_server_name.clone(),
            cluster_methods(Arc::clone(&allocator)),
        )
        .with_span(span.clone())
        .init()
        .await?;

        span.in_scope(|| {
            info!(
                strategy = ?config.allocation_strategy,
                load_topic = %config.load_topic_pattern(),
                "cluster manager started"
            )
        });

        Ok(ClusterManager {
            config,
            tracker,
            allocator,
            topic,
            server,
            tasks,
        })
    }

    pub fn tracker(&self) -> &ClusterLoadTracker {
        &self.tracker
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn config(&self) -> &LoadManagerConfig {
        &self.config
    }

    /// Stops serving requests and consuming load reports.
    pub async fn close(&self) {
        self.server.close().await;
        self.topic.close().await;
        for task in &self.tasks {
            task.abort();
        }
        info!(rpc = %self.config.rpc_server_name, "cluster manager closed");
    }
}

fn cluster_methods(allocator: Arc<Allocator>) -> RpcMethods {
    let media = Arc::clone(&allocator);
    let portal = allocator;

    RpcMethods::new()
        .register(METHOD_ALLOC_MEDIA, move |args: RpcArgs| {
            let allocator = Arc::clone(&media);
            async move {
                let caller_id: Option<String> = args.get_opt(0)?;
                let kind: WorkerKind = args.get(1)?;
                debug!(caller_id = ?caller_id, kind = %kind, "media allocation requested");

                let worker = allocator.allocate(kind).await?;
                Ok::<Value, HandlerError>(serde_json::to_value(worker)?)
            }
        })
        .register(METHOD_ALLOC_PORTAL, move |_args: RpcArgs| {
            let allocator = Arc::clone(&portal);
            async move {
                let address = allocator.alloc_portal()?;
                Ok::<Value, HandlerError>(json!(address))
            }
        })
}
