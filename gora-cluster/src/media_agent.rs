use crate::service_configuration::AgentSettings;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashSet;
use gora_load_manager::rpc::METHOD_GET_ROUTER_CAPABILITIES;
use gora_load_manager::{
    LoadManagerConfig, LoadReporter, LoadSource, ResourceMonitor, WorkerKind, WorkerLoad,
};
use gora_mq::{
    BrokerConnection, HandlerError, MqConfig, RpcArgs, RpcMethods, RpcServer, TopicClient,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, info_span};

/// Audio and video codecs every media worker offers.
const CODECS: [(&str, &str, u32); 2] = [
    ("audio", "audio/opus", 48000),
    ("video", "video/VP8", 90000),
];

struct MediaWorker {
    id: String,
    kind: WorkerKind,
    conn_num: AtomicU32,
    /// Callers served, reported as the item count
    callers: DashSet<String>,
}

/// The workers of one media agent and their counters.
pub(crate) struct MediaWorkers {
    workers: Vec<MediaWorker>,
}

impl MediaWorkers {
    pub(crate) fn new(settings: &AgentSettings) -> Self {
        let producers = (0..settings.producer_workers)
            .map(|i| (format!("{}/producer-{}", settings.group, i), WorkerKind::Producer));
        let consumers = (0..settings.consumer_workers)
            .map(|i| (format!("{}/consumer-{}", settings.group, i), WorkerKind::Consumer));

        let workers = producers
            .chain(consumers)
            .map(|(id, kind)| MediaWorker {
                id,
                kind,
                conn_num: AtomicU32::new(0),
                callers: DashSet::new(),
            })
            .collect();
        MediaWorkers { workers }
    }

    /// Capability descriptor of `worker_id`. Every lookup is counted as a
    /// connection to the worker, callers fetch it right before connecting.
    /// A caller looking up the same worker again is still one item.
    pub(crate) fn router_capabilities(
        &self,
        worker_id: &str,
        caller_id: Option<&str>,
    ) -> Option<Value> {
        let worker = self.workers.iter().find(|w| w.id == worker_id)?;
        worker.conn_num.fetch_add(1, Ordering::Relaxed);
        if let Some(caller_id) = caller_id {
            worker.callers.insert(caller_id.to_string());
        }

        let codecs: Vec<Value> = CODECS
            .iter()
            .map(|(kind, mime_type, clock_rate)| {
                json!({"kind": kind, "mimeType": mime_type, "clockRate": clock_rate})
            })
            .collect();
        Some(json!({
            "routerId": worker.id,
            "type": worker.kind,
            "rtpCapabilities": {"codecs": codecs},
        }))
    }
}

#[async_trait]
impl LoadSource for MediaWorkers {
    async fn worker_loads(&self) -> Vec<WorkerLoad> {
        self.workers
            .iter()
            .map(|w| {
                WorkerLoad::new(w.id.clone(), w.kind).with_counts(
                    w.conn_num.load(Ordering::Relaxed),
                    w.callers.len() as u32,
                )
            })
            .collect()
    }
}

/// A media agent: answers `getRouterCapabilities` on the queue named after
/// its group and reports the group's load on the load topic.
pub(crate) struct MediaAgent {
    group: String,
    server: RpcServer,
    topic: Arc<TopicClient>,
    reporter: LoadReporter,
}

impl MediaAgent {
    pub(crate) async fn start(
        conn: Arc<BrokerConnection>,
        mq: &MqConfig,
        load_manager: &LoadManagerConfig,
        settings: &AgentSettings,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Result<MediaAgent> {
        let span = info_span!("media_agent", group = %settings.group);
        let workers = Arc::new(MediaWorkers::new(settings));

        let server = RpcServer::builder(
            Arc::clone(&conn),
            settings.group.clone(),
            agent_methods(Arc::clone(&workers)),
        )
        .with_span(span.clone())
        .init()
        .await?;

        let topic = Arc::new(
            TopicClient::builder(conn)
                .with_options(mq.topic.clone())
                .with_span(span.clone())
                .init()
                .await?,
        );
        let reporter = LoadReporter::new(
            settings.group.clone(),
            Arc::clone(&topic),
            monitor,
            workers,
            load_manager.clone(),
        );
        reporter.start().await;

        span.in_scope(|| {
            info!(
                producers = settings.producer_workers,
                consumers = settings.consumer_workers,
                "media agent started"
            )
        });

        Ok(MediaAgent {
            group: settings.group.clone(),
            server,
            topic,
            reporter,
        })
    }

    pub(crate) fn group(&self) -> &str {
        &self.group
    }

    pub(crate) async fn close(&self) {
        self.reporter.stop().await;
        self.server.close().await;
        self.topic.close().await;
        info!(group = %self.group, "media agent closed");
    }
}

fn agent_methods(workers: Arc<MediaWorkers>) -> RpcMethods {
    RpcMethods::new().register(METHOD_GET_ROUTER_CAPABILITIES, move |args: RpcArgs| {
        let workers = Arc::clone(&workers);
        async move {
            let worker_id: String = args.get(0)?;
            let caller_id: Option<String> = args.get_opt(1)?;
            let capabilities = workers
                .router_capabilities(&worker_id, caller_id.as_deref())
                .ok_or_else(|| HandlerError::failed(format!("unknown router {}", worker_id)))?;
            Ok::<Value, HandlerError>(capabilities)
        }
    })
}
