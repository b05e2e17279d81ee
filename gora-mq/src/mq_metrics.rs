pub struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub const COUNTERS: [Metric; 8] = [
    RPC_REQUESTS_TOTAL,
    RPC_TIMEOUTS_TOTAL,
    RPC_LATE_REPLIES_TOTAL,
    MALFORMED_MESSAGES_TOTAL,
    RPC_SERVER_REQUESTS_TOTAL,
    RPC_HANDLER_FAILURES_TOTAL,
    TOPIC_PUBLISH_TOTAL,
    TOPIC_PUBLISH_FAILURES_TOTAL,
];
pub const GAUGES: [Metric; 1] = [RPC_PENDING_CALLS];

// RPC CLIENT Metrics --------------------------

pub const RPC_REQUESTS_TOTAL: Metric = Metric {
    name: "gora_rpc_requests_total",
    description: "Total RPC requests sent by clients",
};

pub const RPC_TIMEOUTS_TOTAL: Metric = Metric {
    name: "gora_rpc_timeouts_total",
    description: "Total RPC requests resolved with a timeout",
};

pub const RPC_LATE_REPLIES_TOTAL: Metric = Metric {
    name: "gora_rpc_late_replies_total",
    description: "Replies discarded because no pending call matched their correlation id",
};

pub const RPC_PENDING_CALLS: Metric = Metric {
    name: "gora_rpc_pending_calls",
    description: "RPC calls waiting for a reply",
};

// RPC SERVER Metrics --------------------------

pub const RPC_SERVER_REQUESTS_TOTAL: Metric = Metric {
    name: "gora_rpc_server_requests_total",
    description: "Total RPC requests handled by servers, labeled by method",
};

pub const RPC_HANDLER_FAILURES_TOTAL: Metric = Metric {
    name: "gora_rpc_handler_failures_total",
    description: "RPC handler executions that ended in an error or panic",
};

// TOPIC Metrics --------------------------

pub const TOPIC_PUBLISH_TOTAL: Metric = Metric {
    name: "gora_topic_publish_total",
    description: "Total messages published on the topic exchange",
};

pub const TOPIC_PUBLISH_FAILURES_TOTAL: Metric = Metric {
    name: "gora_topic_publish_failures_total",
    description: "Topic publishes that failed and were dropped",
};

// SHARED Metrics --------------------------

pub const MALFORMED_MESSAGES_TOTAL: Metric = Metric {
    name: "gora_malformed_messages_total",
    description: "Requests, replies or topic messages dropped because they could not be decoded or lacked metadata",
};

/// Registers the descriptions of the messaging metrics with the installed recorder.
pub fn describe_metrics() {
    for metric in COUNTERS {
        metrics::describe_counter!(metric.name, metric.description);
    }
    for metric in GAUGES {
        metrics::describe_gauge!(metric.name, metric.description);
    }
}
