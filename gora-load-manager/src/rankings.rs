use crate::config::LoadWeights;
use crate::load_report::{LoadReport, WorkerKind};

/// A worker able to serve an allocation, with its composite load score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedWorker {
    pub group_name: String,
    pub worker_id: String,
    pub score: f64,
}

/// Composite Load Calculation: ranks the workers of `kind` by their items,
/// connections and the cpu/memory usage of their group.
///
/// ## Algorithm
/// score = items × w.items + connections × w.connections
///       + cpu% × w.cpu + mem% × w.mem
///
/// ## Returns
/// Workers sorted by score (ascending). Equal scores keep table order.
pub fn rankings_composite(
    reports: &[LoadReport],
    kind: WorkerKind,
    weights: &LoadWeights,
) -> Vec<RankedWorker> {
    let mut ranked: Vec<RankedWorker> = reports
        .iter()
        .flat_map(|report| {
            let sys_load =
                report.sys.cpu * 100.0 * weights.cpu + report.sys.mem * 100.0 * weights.mem;
            report.workers_of(kind).map(move |worker| RankedWorker {
                group_name: report.name.clone(),
                worker_id: worker.worker_id.clone(),
                score: worker.item_num as f64 * weights.items
                    + worker.conn_num as f64 * weights.connections
                    + sys_load,
            })
        })
        .collect();

    // stable, ties keep table order
    ranked.sort_by(|a, b| a.score.total_cmp(&b.score));

    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_report::{SystemLoad, WorkerLoad};

    fn create_load_report(name: &str, cpu: f64, mem: f64, workers: Vec<WorkerLoad>) -> LoadReport {
        LoadReport::new(name, SystemLoad { cpu, mem }, workers)
    }

    #[test]
    fn test_single_worker_composite() {
        let reports = vec![create_load_report(
            "a",
            0.5,
            0.25,
            vec![WorkerLoad::new("w1", WorkerKind::Consumer).with_counts(4, 10)],
        )];

        let rankings = rankings_composite(&reports, WorkerKind::Consumer, &LoadWeights::default());

        assert_eq!(rankings.len(), 1);
        // 10 * 1.0 + 4 * 0.5 + 50 * 0.5 + 25 * 0.5 = 49.5
        assert_eq!(rankings[0].score, 49.5);
        assert_eq!(rankings[0].worker_id, "w1");
    }

    #[test]
    fn test_multiple_groups_composite() {
        let reports = vec![
            create_load_report(
                "busy",
                0.5,
                0.25,
                vec![WorkerLoad::new("b1", WorkerKind::Consumer).with_counts(0, 10)],
            ),
            create_load_report(
                "idle",
                0.125,
                0.0625,
                vec![
                    WorkerLoad::new("i1", WorkerKind::Consumer).with_counts(0, 2),
                    WorkerLoad::new("i2", WorkerKind::Producer),
                ],
            ),
        ];

        let rankings = rankings_composite(&reports, WorkerKind::Consumer, &LoadWeights::default());

        assert_eq!(rankings.len(), 2);
        // 2 + 12.5 * 0.5 + 6.25 * 0.5 = 11.375
        assert_eq!(rankings[0].worker_id, "i1");
        assert_eq!(rankings[0].score, 11.375);
        // 10 + 25 + 12.5 = 47.5
        assert_eq!(rankings[1].worker_id, "b1");
        assert_eq!(rankings[1].score, 47.5);
    }

    #[test]
    fn test_same_load_keeps_table_order() {
        let workers = |id: &str| vec![WorkerLoad::new(id, WorkerKind::Producer).with_counts(1, 1)];
        let reports = vec![
            create_load_report("x", 0.2, 0.2, workers("x1")),
            create_load_report("y", 0.2, 0.2, workers("y1")),
            create_load_report("z", 0.2, 0.2, workers("z1")),
        ];

        let rankings = rankings_composite(&reports, WorkerKind::Producer, &LoadWeights::default());
        let ids: Vec<&str> = rankings.iter().map(|r| r.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["x1", "y1", "z1"]);
    }

    #[test]
    fn test_no_worker_of_kind() {
        let reports = vec![create_load_report(
            "a",
            0.0,
            0.0,
            vec![WorkerLoad::new("p", WorkerKind::Producer)],
        )];
        assert!(rankings_composite(&reports, WorkerKind::Consumer, &LoadWeights::default()).is_empty());
        assert!(rankings_composite(&[], WorkerKind::Consumer, &LoadWeights::default()).is_empty());
    }
}
