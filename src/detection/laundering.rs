use std::collections::{BTreeSet, HashSet};

use chrono::Duration;
use serde_json::json;

use crate::config::DetectionConfig;
use crate::error::{AmlError, Result};
use crate::graph::snapshot::Snapshot;
use crate::graph::store::GraphStore;
use crate::graph::types::{AlertType, Transaction};

use super::types::DetectorResult;

fn since<'a>(
    txs: &'a [Transaction],
    snap: &Snapshot,
    window: Duration,
) -> impl Iterator<Item = &'a Transaction> {
    let start = snap.as_of - window;
    txs.iter().filter(move |tx| tx.timestamp >= start)
}

/// Many small deposits in a short window.
pub fn detect_structuring(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let small: Vec<&Transaction> = since(
        &snap.incoming,
        snap,
        Duration::days(cfg.structuring_window_days),
    )
    .filter(|tx| tx.value > 0.0 && tx.value < cfg.structuring_max_deposit)
    .collect();

    let count = small.len();
    if count == 0 || count < cfg.structuring_min_count {
        return DetectorResult::clean(AlertType::Structuring);
    }
    let total: f64 = small.iter().map(|tx| tx.value).sum();
    let bonus = if total > cfg.structuring_bonus_total {
        cfg.structuring_bonus
    } else {
        0.0
    };
    let score = (count as f64 / cfg.structuring_min_count.max(1) as f64) * 20.0 + bonus;

    DetectorResult::flagged(
        AlertType::Structuring,
        score,
        json!({
            "window_days": cfg.structuring_window_days,
            "count": count,
            "total": total,
        }),
    )
}

/// Value passed along a chain, shrinking by at least `peel_ratio` per hop.
pub fn detect_peel_chain(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let adj = snap.adjacency();
    let mut depth = 0usize;

    for r1 in &snap.edges_out {
        if r1.destination == snap.address {
            continue;
        }
        for r2 in adj.get(&r1.destination).into_iter().flatten() {
            if r2.destination == snap.address || r2.destination == r1.destination {
                continue;
            }
            if r2.value_sum > r1.value_sum * cfg.peel_ratio {
                continue;
            }
            let extensions = adj
                .get(&r2.destination)
                .into_iter()
                .flatten()
                .filter(|r3| {
                    r3.destination != snap.address
                        && r3.destination != r1.destination
                        && r3.destination != r2.destination
                        && r3.value_sum <= r2.value_sum * cfg.peel_ratio
                })
                .count();
            depth += extensions.max(1);
        }
    }

    if depth == 0 {
        return DetectorResult::clean(AlertType::PeelChain);
    }
    DetectorResult::flagged(
        AlertType::PeelChain,
        40.0 + 10.0 * depth as f64,
        json!({ "ratio": cfg.peel_ratio, "depth": depth }),
    )
}

/// Pronounced fan-in or fan-out of distinct counterparties.
pub fn detect_mixer(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let fanin = snap
        .edges_in
        .iter()
        .filter(|e| e.source != snap.address)
        .map(|e| &e.source)
        .collect::<HashSet<_>>()
        .len();
    let fanout = snap
        .edges_out
        .iter()
        .filter(|e| e.destination != snap.address)
        .map(|e| &e.destination)
        .collect::<HashSet<_>>()
        .len();

    let score = if fanin >= cfg.mixer_high_fan || fanout >= cfg.mixer_high_fan {
        60.0
    } else if fanin >= cfg.mixer_medium_fan || fanout >= cfg.mixer_medium_fan {
        40.0
    } else {
        return DetectorResult::clean(AlertType::MixerPattern);
    };

    DetectorResult::flagged(
        AlertType::MixerPattern,
        score,
        json!({ "fanin": fanin, "fanout": fanout }),
    )
}

/// Proximity to addresses already flagged as sanctioned, mixers or peel chains.
///
/// The only detector that queries the store beyond the snapshot, so it can
/// fail on its own.
pub async fn detect_taint(
    store: &dyn GraphStore,
    snap: &Snapshot,
    cfg: &DetectionConfig,
) -> Result<DetectorResult> {
    let failed = |e: AmlError| AmlError::Detector {
        detector: AlertType::Taint.as_str().to_string(),
        reason: e.to_string(),
    };

    let flagged = store
        .find_alerts(
            None,
            &[AlertType::Sanction, AlertType::MixerPattern, AlertType::PeelChain],
            cfg.taint_min_source_score,
        )
        .await
        .map_err(failed)?;

    let sources: BTreeSet<_> = flagged
        .into_iter()
        .map(|a| a.address)
        .filter(|a| a != &snap.address)
        .collect();

    let mut nearest: Option<(usize, String)> = None;
    for source in sources.into_iter().take(cfg.taint_source_limit) {
        let path = store
            .shortest_path(&snap.address, &source, cfg.taint_max_hops)
            .await
            .map_err(failed)?;
        let Some(path) = path else { continue };
        let hops = path.len().saturating_sub(1);
        if hops == 0 {
            continue;
        }
        if nearest.as_ref().is_none_or(|(best, _)| hops < *best) {
            nearest = Some((hops, source.to_string()));
        }
        if hops == 1 {
            break;
        }
    }

    let Some((hops, source)) = nearest else {
        return Ok(DetectorResult::clean(AlertType::Taint));
    };
    let score = (50.0 - 10.0 * (hops as f64 - 1.0)).max(0.0);
    if score <= 0.0 {
        return Ok(DetectorResult::clean(AlertType::Taint));
    }
    Ok(DetectorResult::flagged(
        AlertType::Taint,
        score,
        json!({ "max_hops": cfg.taint_max_hops, "hops": hops, "source": source }),
    ))
}

/// Funds that leave the address and come back through 2..=4 hops.
pub fn detect_circularity(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let cycles = snap.count_cycles(
        cfg.circularity_min_len,
        cfg.circularity_max_len,
        cfg.circularity_path_cap,
    );
    let score = match cycles {
        0 => return DetectorResult::clean(AlertType::Circularity),
        1 => 20.0,
        2 => 35.0,
        _ => 50.0,
    };
    DetectorResult::flagged(AlertType::Circularity, score, json!({ "cycles": cycles }))
}

/// High-frequency outgoing bursts.
pub fn detect_velocity(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let recent: Vec<&Transaction> = since(
        &snap.outgoing,
        snap,
        Duration::hours(cfg.velocity_window_hours),
    )
    .collect();
    let count = recent.len();
    if count == 0 || count < cfg.velocity_min_count {
        return DetectorResult::clean(AlertType::VelocityAlert);
    }

    let first = recent.iter().map(|tx| tx.timestamp).min();
    let last = recent.iter().map(|tx| tx.timestamp).max();
    let span_secs = match (first, last) {
        (Some(first), Some(last)) => (last - first).num_seconds(),
        _ => 0,
    };
    let rate = if span_secs > 0 {
        count as f64 / (span_secs as f64 / 3600.0)
    } else {
        count as f64
    };
    if rate < cfg.velocity_min_rate {
        return DetectorResult::clean(AlertType::VelocityAlert);
    }

    let score = if rate >= 50.0 {
        70.0
    } else if rate >= 30.0 {
        55.0
    } else {
        40.0
    };
    DetectorResult::flagged(
        AlertType::VelocityAlert,
        score,
        json!({
            "tx_count": count,
            "txs_per_hour": rate,
            "window_hours": cfg.velocity_window_hours,
        }),
    )
}

/// Long silence followed by sizeable outgoing value.
pub fn detect_dormant_reactivation(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let recent: Vec<&Transaction> = since(
        &snap.outgoing,
        snap,
        Duration::days(cfg.dormant_recent_days),
    )
    .filter(|tx| tx.value >= cfg.dormant_min_value)
    .collect();
    let Some(reactivated) = recent.iter().map(|tx| tx.timestamp).min() else {
        return DetectorResult::clean(AlertType::DormantReactivation);
    };

    // Last sign of life before the reactivation
    let prior = snap
        .incoming
        .iter()
        .chain(snap.outgoing.iter())
        .map(|tx| tx.timestamp)
        .filter(|ts| *ts < reactivated)
        .max()
        .or_else(|| {
            snap.record
                .as_ref()
                .map(|r| r.first_seen)
                .filter(|ts| *ts < reactivated)
        });
    let Some(prior) = prior else {
        return DetectorResult::clean(AlertType::DormantReactivation);
    };

    let dormant = reactivated - prior;
    if dormant <= Duration::days(cfg.dormant_min_lifetime_days) {
        return DetectorResult::clean(AlertType::DormantReactivation);
    }

    let recent_value: f64 = recent.iter().map(|tx| tx.value).sum();
    let score = if recent_value >= 10.0 {
        65.0
    } else if recent_value >= 5.0 {
        50.0
    } else {
        35.0
    };
    DetectorResult::flagged(
        AlertType::DormantReactivation,
        score,
        json!({
            "dormant_days": dormant.num_days(),
            "recent_tx_count": recent.len(),
            "recent_value": recent_value,
        }),
    )
}

/// Repeated exact round-number payments.
pub fn detect_round_amounts(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let amounts: Vec<f64> = since(&snap.outgoing, snap, Duration::days(cfg.round_window_days))
        .map(|tx| tx.value)
        .filter(|v| cfg.round_amounts.iter().any(|r| (v - r).abs() < 1e-9))
        .collect();
    let count = amounts.len();
    if count == 0 || count < cfg.round_min_count {
        return DetectorResult::clean(AlertType::RoundAmounts);
    }

    let score = if count >= 20 {
        50.0
    } else if count >= 10 {
        35.0
    } else {
        25.0
    };
    DetectorResult::flagged(
        AlertType::RoundAmounts,
        score,
        json!({
            "round_tx_count": count,
            "sample_amounts": &amounts[..count.min(5)],
        }),
    )
}

/// Outgoing transactions at suspiciously regular intervals.
pub fn detect_timing_pattern(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let mut stamps: Vec<i64> = since(&snap.outgoing, snap, Duration::days(cfg.timing_window_days))
        .map(|tx| tx.timestamp.timestamp())
        .collect();
    if stamps.len() < cfg.timing_min_count.max(2) {
        return DetectorResult::clean(AlertType::TimingPattern);
    }
    stamps.sort_unstable();

    let intervals: Vec<f64> = stamps.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
    if variance >= cfg.timing_max_variance || mean >= cfg.timing_max_mean_secs {
        return DetectorResult::clean(AlertType::TimingPattern);
    }

    let score = if mean <= 3600.0 {
        55.0
    } else if mean <= 7200.0 {
        45.0
    } else {
        35.0
    };
    DetectorResult::flagged(
        AlertType::TimingPattern,
        score,
        json!({
            "avg_interval_hours": mean / 3600.0,
            "tx_count": stamps.len(),
        }),
    )
}

/// Balanced back-and-forth flows with the same counterparties.
pub fn detect_wash_trading(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let start = snap.as_of - Duration::days(cfg.wash_window_days);
    let mut counterparties = 0usize;
    let mut roundtrips = 0u64;

    for out in &snap.edges_out {
        if out.destination == snap.address || out.last_timestamp < start {
            continue;
        }
        let Some(back) = snap
            .edges_in
            .iter()
            .find(|e| e.source == out.destination && e.last_timestamp >= start)
        else {
            continue;
        };
        if out.count < cfg.wash_min_transfers || back.count < cfg.wash_min_transfers {
            continue;
        }
        if (out.value_sum - back.value_sum).abs() >= out.value_sum * cfg.wash_max_value_diff {
            continue;
        }
        counterparties += 1;
        roundtrips += out.count + back.count;
    }

    if counterparties == 0 {
        return DetectorResult::clean(AlertType::WashTrading);
    }
    let score = if roundtrips >= 20 {
        70.0
    } else if roundtrips >= 10 {
        55.0
    } else {
        40.0
    };
    DetectorResult::flagged(
        AlertType::WashTrading,
        score,
        json!({
            "counterparties": counterparties,
            "total_roundtrips": roundtrips,
        }),
    )
}

/// Deep, fast outgoing chains: value pushed through several hops within a window.
pub fn detect_layering(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let window = Duration::hours(cfg.layering_window_hours);
    let mut chains = 0usize;
    let mut depth_sum = 0usize;
    let mut span_sum_secs = 0i64;

    for path in snap.simple_paths(cfg.layering_max_depth, cfg.layering_path_cap) {
        if path.len() < cfg.layering_min_depth {
            continue;
        }
        let first = path.iter().map(|e| e.last_timestamp).min();
        let last = path.iter().map(|e| e.last_timestamp).max();
        let (Some(first), Some(last)) = (first, last) else { continue };
        let span = last - first;
        if span >= window {
            continue;
        }
        chains += 1;
        depth_sum += path.len();
        span_sum_secs += span.num_seconds();
    }

    if chains == 0 {
        return DetectorResult::clean(AlertType::Layering);
    }
    let avg_depth = depth_sum as f64 / chains as f64;
    let avg_span_hours = span_sum_secs as f64 / chains as f64 / 3600.0;
    let speed = if avg_span_hours < 1.0 {
        30.0
    } else if avg_span_hours < 6.0 {
        20.0
    } else if avg_span_hours < 24.0 {
        10.0
    } else {
        0.0
    };
    let score = (10.0 * chains as f64).min(40.0) + (5.0 * avg_depth).min(30.0) + speed;

    DetectorResult::flagged(
        AlertType::Layering,
        score,
        json!({
            "chains": chains,
            "avg_depth": avg_depth,
            "avg_span_hours": avg_span_hours,
            "window_hours": cfg.layering_window_hours,
        }),
    )
}

/// Many near-zero deposits from several senders.
pub fn detect_dust_attack(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let dust: Vec<&Transaction> = snap
        .incoming
        .iter()
        .filter(|tx| tx.value > 0.0 && tx.value <= cfg.dust_threshold)
        .collect();
    let count = dust.len();
    if count <= cfg.dust_min_count {
        return DetectorResult::clean(AlertType::DustAttack);
    }
    let senders = dust.iter().map(|tx| &tx.from).collect::<HashSet<_>>().len();

    let mut score = 0.0;
    if count > cfg.dust_min_count * 2 {
        score = (5.0 * count as f64).min(80.0);
    }
    if senders > cfg.dust_min_count {
        score += 20.0;
    }
    DetectorResult::flagged(
        AlertType::DustAttack,
        score,
        json!({
            "dust_transactions": count,
            "unique_senders": senders,
            "threshold": cfg.dust_threshold,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::memory::MemoryGraph;
    use crate::graph::types::{Address, Transfer};
    use chrono::{DateTime, TimeZone, Utc};

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn tx(n: usize, from: &str, to: &str, value: f64, at: DateTime<Utc>) -> Transaction {
        Transaction {
            hash: format!("0x{:064x}", n),
            from: addr(from),
            to: addr(to),
            value,
            timestamp: at,
            block: 1_000 + n as u64,
            nonce: n as u64,
        }
    }

    fn edge(from: &str, to: &str, count: u64, value: f64, at: DateTime<Utc>) -> Transfer {
        Transfer {
            source: addr(from),
            destination: addr(to),
            count,
            value_sum: value,
            last_timestamp: at,
        }
    }

    fn empty() -> Snapshot {
        Snapshot::empty(addr("a"), now())
    }

    #[test]
    fn empty_history_raises_nothing() {
        let cfg = DetectionConfig::default();
        let snap = empty();
        for r in [
            detect_structuring(&snap, &cfg),
            detect_peel_chain(&snap, &cfg),
            detect_mixer(&snap, &cfg),
            detect_circularity(&snap, &cfg),
            detect_velocity(&snap, &cfg),
            detect_dormant_reactivation(&snap, &cfg),
            detect_round_amounts(&snap, &cfg),
            detect_timing_pattern(&snap, &cfg),
            detect_wash_trading(&snap, &cfg),
            detect_layering(&snap, &cfg),
            detect_dust_attack(&snap, &cfg),
        ] {
            assert!(!r.detected, "{} fired on empty history", r.alert_type);
            assert_eq!(r.score, 0.0);
        }
    }

    #[test]
    fn six_small_deposits_are_structuring() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        for i in 0..6 {
            let at = now() - Duration::hours(8 * i as i64);
            snap.incoming.push(tx(i, &format!("s{}", i), "a", 0.2, at));
        }
        let r = detect_structuring(&snap, &cfg);
        assert!(r.detected);
        assert!(r.score >= 20.0);
        assert_eq!(r.details["count"], 6);
    }

    #[test]
    fn old_deposits_fall_outside_structuring_window() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        for i in 0..6 {
            let at = now() - Duration::days(10) - Duration::hours(i as i64);
            snap.incoming.push(tx(i, "s", "a", 0.2, at));
        }
        assert!(!detect_structuring(&snap, &cfg).detected);
    }

    #[test]
    fn shrinking_hops_form_a_peel_chain() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        let e1 = edge("a", "b", 1, 10.0, now());
        snap.edges_out = vec![e1.clone()];
        snap.reachable = vec![e1, edge("b", "c", 1, 6.0, now()), edge("c", "d", 1, 4.0, now())];
        let r = detect_peel_chain(&snap, &cfg);
        assert!(r.detected);
        assert_eq!(r.details["depth"], 1);
        assert_eq!(r.score, 50.0);

        // second hop not small enough
        snap.reachable[1].value_sum = 9.0;
        assert!(!detect_peel_chain(&snap, &cfg).detected);
    }

    #[test]
    fn fan_out_tiers() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        snap.edges_out = (0..12).map(|i| edge("a", &format!("d{}", i), 1, 1.0, now())).collect();
        assert_eq!(detect_mixer(&snap, &cfg).score, 40.0);
        snap.edges_out = (0..25).map(|i| edge("a", &format!("d{}", i), 1, 1.0, now())).collect();
        let r = detect_mixer(&snap, &cfg);
        assert_eq!(r.score, 60.0);
        assert_eq!(r.details["fanout"], 25);
    }

    #[test]
    fn triangle_is_one_cycle_scoring_twenty() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        let e = edge("a", "b", 1, 1.0, now());
        snap.edges_out = vec![e.clone()];
        snap.reachable = vec![e, edge("b", "c", 1, 1.0, now()), edge("c", "a", 1, 1.0, now())];
        let r = detect_circularity(&snap, &cfg);
        assert!(r.detected);
        assert_eq!(r.score, 20.0);
        assert_eq!(r.details["cycles"], 1);
    }

    #[test]
    fn burst_of_outgoing_transactions_is_velocity() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        for i in 0..30 {
            snap.outgoing.push(tx(i, "a", "b", 0.1, now() - Duration::minutes(i as i64)));
        }
        let r = detect_velocity(&snap, &cfg);
        assert!(r.detected);
        // 30 tx in 29 minutes is ~62 per hour
        assert_eq!(r.score, 70.0);
    }

    #[test]
    fn reactivation_after_long_silence() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        snap.incoming.push(tx(0, "b", "a", 20.0, now() - Duration::days(400)));
        snap.outgoing.push(tx(1, "a", "c", 12.0, now() - Duration::days(2)));
        let r = detect_dormant_reactivation(&snap, &cfg);
        assert!(r.detected);
        assert_eq!(r.score, 65.0);

        // steady activity is not dormancy
        snap.incoming.push(tx(2, "b", "a", 1.0, now() - Duration::days(20)));
        assert!(!detect_dormant_reactivation(&snap, &cfg).detected);
    }

    #[test]
    fn round_amounts_are_counted() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        for i in 0..6 {
            snap.outgoing.push(tx(i, "a", "b", 5.0, now() - Duration::days(i as i64)));
        }
        snap.outgoing.push(tx(9, "a", "b", 1.2345, now()));
        let r = detect_round_amounts(&snap, &cfg);
        assert_eq!(r.score, 25.0);
        assert_eq!(r.details["round_tx_count"], 6);
    }

    #[test]
    fn hourly_schedule_is_a_timing_pattern() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        for i in 0..12 {
            snap.outgoing.push(tx(i, "a", "b", 0.3, now() - Duration::hours(i as i64)));
        }
        let r = detect_timing_pattern(&snap, &cfg);
        assert!(r.detected);
        assert_eq!(r.score, 55.0);
    }

    #[test]
    fn balanced_round_trips_are_wash_trading() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        snap.edges_out = vec![edge("a", "b", 5, 10.0, now())];
        snap.edges_in = vec![edge("b", "a", 6, 10.5, now())];
        let r = detect_wash_trading(&snap, &cfg);
        assert_eq!(r.score, 55.0);
        assert_eq!(r.details["total_roundtrips"], 11);

        snap.edges_in[0].value_sum = 15.0;
        assert!(!detect_wash_trading(&snap, &cfg).detected);
    }

    #[test]
    fn fast_deep_chain_is_layering() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        let t = now() - Duration::hours(2);
        let e = edge("a", "b", 1, 5.0, t);
        snap.edges_out = vec![e.clone()];
        snap.reachable = vec![
            e,
            edge("b", "c", 1, 5.0, t + Duration::minutes(10)),
            edge("c", "d", 1, 5.0, t + Duration::minutes(20)),
        ];
        let r = detect_layering(&snap, &cfg);
        assert!(r.detected);
        // one chain (10) + depth 3 (15) + under an hour (30)
        assert_eq!(r.score, 55.0);
    }

    #[test]
    fn dust_from_many_senders() {
        let cfg = DetectionConfig::default();
        let mut snap = empty();
        for i in 0..12 {
            snap.incoming.push(tx(i, &format!("s{}", i), "a", 0.00001, now()));
        }
        let r = detect_dust_attack(&snap, &cfg);
        assert!(r.detected);
        assert_eq!(r.score, 80.0);
    }

    #[tokio::test]
    async fn taint_decays_with_distance() {
        let cfg = DetectionConfig::default();
        let store = MemoryGraph::new();
        store.record_transaction(&tx(1, "a", "b", 1.0, now())).await.unwrap();
        store.record_transaction(&tx(2, "b", "bad", 1.0, now())).await.unwrap();
        store
            .write_alert(&addr("bad"), AlertType::Sanction, 100.0, json!({"list": "ofac"}))
            .await
            .unwrap();

        let snap = empty();
        let r = detect_taint(&store, &snap, &cfg).await.unwrap();
        assert!(r.detected);
        assert_eq!(r.score, 40.0);
        assert_eq!(r.details["hops"], 2);
    }

    #[tokio::test]
    async fn taint_reports_store_failure_as_detector_error() {
        let cfg = DetectionConfig::default();
        let store = MemoryGraph::new();
        store.set_available(false);
        let err = detect_taint(&store, &empty(), &cfg).await.unwrap_err();
        assert!(matches!(err, AmlError::Detector { .. }));
    }
}
