//! Pairwise gossip between in-memory replicas converges.

use spiron_crdt::{merge, ApprovalCounter, FinalityDetector, ReplicatedRecord, ReplicatedVector};

fn seed(replica: &str, vector: Vec<f64>, ts: i64) -> ReplicatedRecord {
    let mut approvals = ApprovalCounter::new();
    approvals.increment(replica);
    ReplicatedRecord::new("eddy", ReplicatedVector::new(replica, ts, vector), approvals, ts)
}

/// Symmetric exchange: both sides end with the merge of both.
fn exchange(replicas: &mut [ReplicatedRecord], i: usize, j: usize) {
    let merged = merge(&replicas[i], &replicas[j]);
    replicas[i] = merged.clone();
    replicas[j] = merged;
}

#[test]
fn three_replicas_converge_to_latest_write() {
    let mut replicas = vec![
        seed("node-1", vec![1.0, 0.0, 0.0], 100),
        seed("node-2", vec![0.0, 1.0, 0.0], 200),
        seed("node-3", vec![0.0, 0.0, 1.0], 150),
    ];

    for (i, j) in [(0, 2), (2, 1), (1, 0), (0, 2)] {
        exchange(&mut replicas, i, j);
    }

    for r in &replicas {
        assert_eq!(r.state.timestamp, 200);
        assert_eq!(r.state.vector, vec![0.0, 1.0, 0.0]);
        assert_eq!(r.cumulative(), 3);
    }
    assert_eq!(replicas[0], replicas[1]);
    assert_eq!(replicas[1], replicas[2]);
}

#[test]
fn exchange_order_does_not_matter() {
    let seeds = vec![
        seed("node-1", vec![1.0, 0.0, 0.0], 100),
        seed("node-2", vec![0.0, 1.0, 0.0], 200),
        seed("node-3", vec![0.0, 0.0, 1.0], 150),
    ];

    let mut forward = seeds.clone();
    for (i, j) in [(0, 1), (1, 2), (0, 1)] {
        exchange(&mut forward, i, j);
    }

    let mut backward = seeds;
    for (i, j) in [(2, 1), (1, 0), (2, 1)] {
        exchange(&mut backward, i, j);
    }

    assert_eq!(forward[0], backward[0]);
}

#[test]
fn every_replica_finalizes_independently() {
    let mut replicas = vec![
        seed("node-1", vec![1.0, 0.0, 0.0], 100),
        seed("node-2", vec![0.0, 1.0, 0.0], 200),
        seed("node-3", vec![0.0, 0.0, 1.0], 150),
    ];
    let detectors: Vec<FinalityDetector> = (0..3).map(|_| FinalityDetector::new()).collect();

    for (i, j) in [(0, 1), (1, 2), (2, 0)] {
        exchange(&mut replicas, i, j);
        detectors[i].check_finality("eddy", &replicas[i], 3);
        detectors[j].check_finality("eddy", &replicas[j], 3);
    }

    for d in &detectors {
        assert!(d.is_finalized("eddy"));
        assert_eq!(d.finalized_record("eddy").unwrap().cumulative(), 3);
    }
}
