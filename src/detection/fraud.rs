use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Duration;
use serde_json::json;

use crate::config::DetectionConfig;
use crate::graph::snapshot::Snapshot;
use crate::graph::types::AlertType;

use super::types::DetectorResult;

const RUG_PULL_DETECTED: f64 = 60.0;
const PONZI_DETECTED: f64 = 60.0;
const PHISHING_DETECTED: f64 = 60.0;
const MEV_DETECTED: f64 = 70.0;

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sample standard deviation.
fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Pool drained by one dominant withdrawal, then silence.
pub fn detect_rug_pull(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    if snap.incoming.is_empty() && snap.outgoing.is_empty() {
        return DetectorResult::clean(AlertType::RugPull);
    }
    let total_in: f64 = snap.incoming.iter().map(|tx| tx.value).sum();
    let total_out: f64 = snap.outgoing.iter().map(|tx| tx.value).sum();

    let mut score = 0.0;
    let mut indicators = Vec::new();

    if total_in > 0.0 && total_out > total_in * cfg.rug_outflow_ratio {
        score += 40.0;
        indicators.push("large_outflow_relative_to_inflow");
    }

    let max_out = snap
        .outgoing
        .iter()
        .map(|tx| tx.value)
        .fold(0.0_f64, f64::max);
    if max_out > 0.0 && max_out > total_out * cfg.rug_single_withdrawal_ratio {
        score += 40.0;
        indicators.push("single_large_withdrawal");
    }

    if let Some(last_out) = snap.outgoing.iter().map(|tx| tx.timestamp).max() {
        if snap.as_of - last_out >= Duration::days(cfg.rug_silence_days) {
            score += 20.0;
            indicators.push("no_activity_after_withdrawal");
        }
    }

    let withdrawal_percentage = if total_in > 0.0 {
        total_out / total_in * 100.0
    } else {
        0.0
    };
    DetectorResult::scored(
        AlertType::RugPull,
        score >= RUG_PULL_DETECTED,
        score,
        json!({
            "indicators": indicators,
            "total_in": total_in,
            "total_out": total_out,
            "withdrawal_percentage": withdrawal_percentage,
        }),
    )
}

/// Many uniform deposits paying out a narrow set of receivers.
pub fn detect_ponzi(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let senders: HashSet<_> = snap.incoming.iter().map(|tx| &tx.from).collect();
    let receivers: HashSet<_> = snap.outgoing.iter().map(|tx| &tx.to).collect();
    let inflows: Vec<f64> = snap.incoming.iter().map(|tx| tx.value).filter(|v| *v > 0.0).collect();
    let outflows: Vec<f64> = snap.outgoing.iter().map(|tx| tx.value).filter(|v| *v > 0.0).collect();

    let mut score = 0.0;
    let mut indicators = Vec::new();

    if senders.len() > cfg.ponzi_min_depositors {
        score += 30.0;
        indicators.push("many_depositors");
    }

    let ratio = if senders.is_empty() {
        0.0
    } else {
        receivers.len() as f64 / senders.len() as f64
    };
    if !senders.is_empty() && !receivers.is_empty() && ratio < cfg.ponzi_max_receiver_ratio {
        score += 30.0;
        indicators.push("pyramid_structure");
    }

    if inflows.len() > 10 && stdev(&inflows) < mean(&inflows) * 0.5 {
        score += 20.0;
        indicators.push("consistent_deposit_amounts");
    }

    if !inflows.is_empty() && !outflows.is_empty() && mean(&outflows) > mean(&inflows) * 1.2 {
        score += 20.0;
        indicators.push("returns_exceed_deposits");
    }

    DetectorResult::scored(
        AlertType::PonziScheme,
        score >= PONZI_DETECTED,
        score,
        json!({
            "indicators": indicators,
            "unique_investors": senders.len(),
            "unique_receivers": receivers.len(),
            "pyramid_ratio": ratio,
        }),
    )
}

/// Small deposits from many victims, swept out to a few addresses shortly after.
pub fn detect_phishing(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let victims: HashSet<_> = snap
        .incoming
        .iter()
        .filter(|tx| tx.from != snap.address)
        .map(|tx| &tx.from)
        .collect();
    let destinations: HashSet<_> = snap.outgoing.iter().map(|tx| &tx.to).collect();
    let amounts: Vec<f64> = snap.incoming.iter().map(|tx| tx.value).filter(|v| *v > 0.0).collect();

    let mut score = 0.0;
    let mut indicators = Vec::new();

    if victims.len() > cfg.phishing_min_victims {
        score += 40.0;
        indicators.push("multiple_victims");
    }

    if !amounts.is_empty() && mean(&amounts) < cfg.phishing_max_avg_amount {
        score += 20.0;
        indicators.push("small_amounts_per_victim");
    }

    if let Some(last_deposit) = snap.incoming.iter().map(|tx| tx.timestamp).max() {
        let rapid = snap.outgoing.iter().any(|tx| {
            let lag = tx.timestamp - last_deposit;
            lag >= Duration::zero() && lag < Duration::seconds(cfg.phishing_withdraw_within_secs)
        });
        if rapid {
            score += 30.0;
            indicators.push("rapid_withdrawal_after_deposits");
        }
    }

    if !destinations.is_empty() && destinations.len() < cfg.phishing_max_destinations {
        score += 10.0;
        indicators.push("consolidated_to_few_addresses");
    }

    DetectorResult::scored(
        AlertType::Phishing,
        score >= PHISHING_DETECTED,
        score,
        json!({
            "indicators": indicators,
            "potential_victims": victims.len(),
            "consolidation_addresses": destinations.len(),
        }),
    )
}

/// Bot-like sending: huge volume, shared blocks, sub-minute gaps.
pub fn detect_mev_bot(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let txs = &snap.outgoing;
    if txs.is_empty() {
        return DetectorResult::clean(AlertType::MevBot);
    }

    let mut score = 0.0;
    let mut indicators = Vec::new();

    if txs.len() > cfg.mev_min_tx {
        score += 40.0;
        indicators.push("very_high_tx_frequency");
    }

    let mut per_block: HashMap<u64, usize> = HashMap::new();
    for tx in txs {
        *per_block.entry(tx.block).or_default() += 1;
    }
    let in_shared_blocks: usize = per_block.values().filter(|n| **n > 1).sum();
    let shared_ratio = in_shared_blocks as f64 / txs.len() as f64;
    if shared_ratio > cfg.mev_multi_block_ratio {
        score += 40.0;
        indicators.push("multiple_tx_in_same_blocks");
    }

    let mut stamps: Vec<i64> = txs.iter().map(|tx| tx.timestamp.timestamp()).collect();
    stamps.sort_unstable();
    let gaps: Vec<f64> = stamps.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    if stamps.len() > 10 && mean(&gaps) < cfg.mev_max_mean_gap_secs {
        score += 20.0;
        indicators.push("very_rapid_transaction_pattern");
    }

    DetectorResult::scored(
        AlertType::MevBot,
        score >= MEV_DETECTED,
        score,
        json!({
            "indicators": indicators,
            "tx_count": txs.len(),
            "shared_block_ratio": shared_ratio,
        }),
    )
}

/// Blocks in which the address emitted many high-value transactions.
pub fn detect_flash_loan(snap: &Snapshot, cfg: &DetectionConfig) -> DetectorResult {
    let mut blocks: BTreeMap<u64, (usize, f64)> = BTreeMap::new();
    for tx in &snap.outgoing {
        let entry = blocks.entry(tx.block).or_default();
        entry.0 += 1;
        entry.1 += tx.value;
    }

    let mut suspicious: Vec<(u64, usize, f64)> = blocks
        .into_iter()
        .filter(|(_, (n, volume))| *n > cfg.flash_min_tx_per_block && *volume > cfg.flash_min_block_volume)
        .map(|(block, (n, volume))| (block, n, volume))
        .collect();
    if suspicious.is_empty() {
        return DetectorResult::clean(AlertType::FlashLoan);
    }
    suspicious.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
    suspicious.truncate(10);

    let score = (30.0 * suspicious.len() as f64).min(100.0);
    let evidence: Vec<_> = suspicious
        .iter()
        .map(|(block, n, volume)| json!({ "block": block, "transactions": n, "volume": volume }))
        .collect();
    DetectorResult::flagged(
        AlertType::FlashLoan,
        score,
        json!({ "suspicious_blocks": evidence }),
    )
}
