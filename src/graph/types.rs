use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{AmlError, Result};

/// Canonical (trimmed, lower-cased) chain address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self> {
        let canonical = raw.trim().to_lowercase();
        if canonical.is_empty() {
            return Err(AmlError::Validation("address must not be empty".into()));
        }
        // EVM-looking addresses must actually be valid 20-byte hex
        if canonical.starts_with("0x") && canonical.len() == 42 {
            alloy::primitives::Address::from_str(&canonical).map_err(|e| {
                AmlError::Validation(format!("invalid address '{}': {}", raw, e))
            })?;
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = AmlError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Structural features written by the graph-analytics collaborator.
/// Absent features read as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuralFeatures {
    pub pagerank: f64,
    pub degree: f64,
    pub in_degree: f64,
    pub out_degree: f64,
    pub community_id: Option<i64>,
    pub triangle_count: f64,
}

/// A participant node in the transaction graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: Address,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_in: f64,
    pub total_out: f64,
    pub risk_score: Option<f64>,
    pub features: Option<StructuralFeatures>,
}

impl AddressRecord {
    pub fn new(address: Address, seen: DateTime<Utc>) -> Self {
        Self {
            address,
            first_seen: seen,
            last_seen: seen,
            total_in: 0.0,
            total_out: 0.0,
            risk_score: None,
            features: None,
        }
    }
}

/// Immutable raw value transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub from: Address,
    pub to: Address,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub block: u64,
    pub nonce: u64,
}

/// Aggregated directed edge: every raw transaction from `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub source: Address,
    pub destination: Address,
    pub count: u64,
    pub value_sum: f64,
    pub last_timestamp: DateTime<Utc>,
}

/// A counterparty and the total value exchanged with it in both directions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Counterparty {
    pub address: Address,
    pub total_value: f64,
}

/// Types of alerts the detectors can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Structuring,
    PeelChain,
    MixerPattern,
    Taint,
    Circularity,
    VelocityAlert,
    DormantReactivation,
    RoundAmounts,
    TimingPattern,
    WashTrading,
    Layering,
    RugPull,
    PonziScheme,
    Phishing,
    MevBot,
    DustAttack,
    FlashLoan,
    /// Raised by external sanction screening; only consumed here as a taint source.
    Sanction,
}

impl AlertType {
    pub const ALL: [AlertType; 18] = [
        Self::Structuring,
        Self::PeelChain,
        Self::MixerPattern,
        Self::Taint,
        Self::Circularity,
        Self::VelocityAlert,
        Self::DormantReactivation,
        Self::RoundAmounts,
        Self::TimingPattern,
        Self::WashTrading,
        Self::Layering,
        Self::RugPull,
        Self::PonziScheme,
        Self::Phishing,
        Self::MevBot,
        Self::DustAttack,
        Self::FlashLoan,
        Self::Sanction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structuring => "STRUCTURING",
            Self::PeelChain => "PEEL_CHAIN",
            Self::MixerPattern => "MIXER_PATTERN",
            Self::Taint => "TAINT",
            Self::Circularity => "CIRCULARITY",
            Self::VelocityAlert => "VELOCITY_ALERT",
            Self::DormantReactivation => "DORMANT_REACTIVATION",
            Self::RoundAmounts => "ROUND_AMOUNTS",
            Self::TimingPattern => "TIMING_PATTERN",
            Self::WashTrading => "WASH_TRADING",
            Self::Layering => "LAYERING",
            Self::RugPull => "RUG_PULL",
            Self::PonziScheme => "PONZI_SCHEME",
            Self::Phishing => "PHISHING",
            Self::MevBot => "MEV_BOT",
            Self::DustAttack => "DUST_ATTACK",
            Self::FlashLoan => "FLASH_LOAN",
            Self::Sanction => "SANCTION",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = AmlError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AmlError::Validation(format!("unknown alert type '{}'", s)))
    }
}

/// Evidence that an address exhibits a named pattern. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub address: Address,
    pub alert_type: AlertType,
    pub score: f64,
    pub details: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_canonicalized() {
        let a = Address::parse("  0xAbCdEf0123456789abcdef0123456789ABCDEF01 ").unwrap();
        assert_eq!(a.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(
            a,
            Address::parse("0xabcdef0123456789abcdef0123456789abcdef01").unwrap()
        );
    }

    #[test]
    fn address_rejects_bad_input() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("   ").is_err());
        assert!(Address::parse("0xzzzdef0123456789abcdef0123456789abcdef01").is_err());
    }

    #[test]
    fn non_evm_identifiers_are_accepted() {
        let a = Address::parse("Wallet-A").unwrap();
        assert_eq!(a.as_str(), "wallet-a");
    }

    #[test]
    fn alert_type_round_trips_through_name() {
        for t in AlertType::ALL {
            assert_eq!(t.as_str().parse::<AlertType>().unwrap(), t);
        }
        assert_eq!("mixer_pattern".parse::<AlertType>().unwrap(), AlertType::MixerPattern);
        assert!("nope".parse::<AlertType>().is_err());
    }
}
