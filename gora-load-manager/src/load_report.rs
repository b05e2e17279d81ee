use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Load snapshot of one worker group, published by its agent on the load
/// topic and kept by the cluster manager to take allocation decisions.
///
/// Wire shape: `{name, sys: {cpu, mem}, workers: [{workerId, type, connNum, itemNum}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Unique worker-group name, also the agent's RPC server name
    pub name: String,
    /// Zero when the agent does not report host figures
    #[serde(default)]
    pub sys: SystemLoad,
    #[serde(default)]
    pub workers: Vec<WorkerLoad>,
}

impl LoadReport {
    pub fn new(name: impl Into<String>, sys: SystemLoad, workers: Vec<WorkerLoad>) -> Self {
        LoadReport {
            name: name.into(),
            sys,
            workers,
        }
    }

    /// Workers of the given kind, in report order.
    pub fn workers_of(&self, kind: WorkerKind) -> impl Iterator<Item = &WorkerLoad> {
        self.workers.iter().filter(move |w| w.kind == kind)
    }
}

/// Host usage as fractions of capacity (0.0 to 1.0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemLoad {
    pub cpu: f64,
    pub mem: f64,
}

impl SystemLoad {
    /// Builds a load from raw fractions, rounded to `decimals` places.
    pub fn rounded(cpu: f64, mem: f64, decimals: u32) -> Self {
        SystemLoad {
            cpu: round_to(cpu, decimals),
            mem: round_to(mem, decimals),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLoad {
    #[serde(alias = "routerId")]
    pub worker_id: String,
    #[serde(rename = "type")]
    pub kind: WorkerKind,
    /// Open transports
    #[serde(default)]
    pub conn_num: u32,
    /// Producers or consumers served
    #[serde(default)]
    pub item_num: u32,
}

impl WorkerLoad {
    pub fn new(worker_id: impl Into<String>, kind: WorkerKind) -> Self {
        WorkerLoad {
            worker_id: worker_id.into(),
            kind,
            conn_num: 0,
            item_num: 0,
        }
    }

    pub fn with_counts(mut self, conn_num: u32, item_num: u32) -> Self {
        self.conn_num = conn_num;
        self.item_num = item_num;
        self
    }
}

/// What a media worker serves. Serialized as `"PRODUCER"` / `"CONSUMER"`;
/// the numeric codes `0` / `1` sent by older agents are accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Producer,
    Consumer,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Producer => "PRODUCER",
            WorkerKind::Consumer => "CONSUMER",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRODUCER" => Ok(WorkerKind::Producer),
            "CONSUMER" => Ok(WorkerKind::Consumer),
            other => Err(format!("unknown worker kind: {}", other)),
        }
    }
}

impl Serialize for WorkerKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WorkerKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KindVisitor;

        impl Visitor<'_> for KindVisitor {
            type Value = WorkerKind;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"PRODUCER\", \"CONSUMER\", 0 or 1")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<WorkerKind, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<WorkerKind, E> {
                match v {
                    0 => Ok(WorkerKind::Producer),
                    1 => Ok(WorkerKind::Consumer),
                    other => Err(E::custom(format!("unknown worker kind code: {}", other))),
                }
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<WorkerKind, E> {
                match u64::try_from(v) {
                    Ok(v) => self.visit_u64(v),
                    Err(_) => Err(E::custom(format!("unknown worker kind code: {}", v))),
                }
            }
        }

        deserializer.deserialize_any(KindVisitor)
    }
}

/// Rounds `n` to `decimals` decimal places.
pub fn round_to(n: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (n * factor).round() / factor
}
