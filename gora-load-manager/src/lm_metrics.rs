pub struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub const COUNTERS: [Metric; 3] = [
    LOAD_REPORTS_RECEIVED_TOTAL,
    LOAD_REPORTS_PUBLISHED_TOTAL,
    ALLOCATIONS_TOTAL,
];
pub const GAUGES: [Metric; 1] = [TRACKED_GROUPS];

// CLUSTER MANAGER Metrics --------------------------

pub const LOAD_REPORTS_RECEIVED_TOTAL: Metric = Metric {
    name: "gora_load_reports_received_total",
    description: "Load reports received by the cluster manager",
};

pub const TRACKED_GROUPS: Metric = Metric {
    name: "gora_tracked_worker_groups",
    description: "Worker groups currently in the load table",
};

pub const ALLOCATIONS_TOTAL: Metric = Metric {
    name: "gora_allocations_total",
    description: "Allocation requests, labeled by worker kind and result",
};

// AGENT Metrics --------------------------

pub const LOAD_REPORTS_PUBLISHED_TOTAL: Metric = Metric {
    name: "gora_load_reports_published_total",
    description: "Load reports published by agents",
};

/// Registers the descriptions of the load manager metrics with the installed recorder.
pub fn describe_metrics() {
    for metric in COUNTERS {
        metrics::describe_counter!(metric.name, metric.description);
    }
    for metric in GAUGES {
        metrics::describe_gauge!(metric.name, metric.description);
    }
}
