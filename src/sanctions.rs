use std::collections::HashMap;
use std::io::Read;

use serde_json::json;

use crate::error::Result;
use crate::graph::store::GraphStore;
use crate::graph::types::{Address, AlertType};

/// A sanctions-list entry with its listed chain addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct SanctionEntry {
    pub sdn_id: String,
    pub entity_name: String,
    pub program: String,
    pub addresses: Vec<Address>,
}

/// Parse a simplified SDN CSV.
/// Expected columns: sdn_id, entity_name, program, address.
/// Each row lists one address for one entry; rows without an EVM address are skipped.
pub fn parse_sanctions<R: Read>(reader: R) -> eyre::Result<Vec<SanctionEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut by_sdn: HashMap<String, SanctionEntry> = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("").trim().to_string();
        let raw = field(3);
        if !raw.starts_with("0x") {
            continue;
        }
        let address = match Address::parse(&raw) {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(address = %raw, error = %e, "Skipping malformed sanctioned address");
                continue;
            }
        };

        by_sdn
            .entry(field(0))
            .or_insert_with(|| SanctionEntry {
                sdn_id: field(0),
                entity_name: field(1),
                program: field(2),
                addresses: Vec::new(),
            })
            .addresses
            .push(address);
    }

    let mut entries: Vec<SanctionEntry> = by_sdn.into_values().collect();
    entries.sort_by(|a, b| a.sdn_id.cmp(&b.sdn_id));
    tracing::info!(entries = entries.len(), "Parsed sanctions list");
    Ok(entries)
}

pub fn load_sanctions_csv(path: &str) -> eyre::Result<Vec<SanctionEntry>> {
    let file = std::fs::File::open(path)
        .map_err(|e| eyre::eyre!("Failed to open sanctions CSV '{}': {}", path, e))?;
    parse_sanctions(file)
}

/// Write one `SANCTION` alert per listed address. These alerts seed taint
/// propagation. Returns how many were new.
pub async fn seed_sanctions(store: &dyn GraphStore, entries: &[SanctionEntry]) -> Result<usize> {
    let mut created = 0;
    for entry in entries {
        for address in &entry.addresses {
            let details = json!({
                "sdn_id": entry.sdn_id,
                "entity": entry.entity_name,
                "program": entry.program,
            });
            if store
                .write_alert(address, AlertType::Sanction, 100.0, details)
                .await?
                .is_some()
            {
                created += 1;
            }
        }
    }
    tracing::info!(created, "Sanctioned addresses seeded");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::memory::MemoryGraph;

    const CSV: &str = "\
sdn_id,entity_name,program,address
1001,Mixer One,CYBER2,0x8589427373D6D84E98730D7795D8f6f8731FDA16
1001,Mixer One,CYBER2,0x722122dF12D4e14e13Ac3b6895a86e84145b6967
2002,Someone,SDGT,bc1qnotanevmaddress
3003,Broken,CYBER2,0xzz00000000000000000000000000000000000000
";

    #[test]
    fn rows_are_grouped_by_entry() {
        let entries = parse_sanctions(CSV.as_bytes()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sdn_id, "1001");
        assert_eq!(entries[0].addresses.len(), 2);
        assert_eq!(
            entries[0].addresses[0].as_str(),
            "0x8589427373d6d84e98730d7795d8f6f8731fda16"
        );
    }

    #[tokio::test]
    async fn seeding_twice_creates_nothing_new() {
        let store = MemoryGraph::new();
        let entries = parse_sanctions(CSV.as_bytes()).unwrap();
        assert_eq!(seed_sanctions(&store, &entries).await.unwrap(), 2);
        assert_eq!(seed_sanctions(&store, &entries).await.unwrap(), 0);

        let alerts = store.find_alerts(None, &[AlertType::Sanction], 50.0).await.unwrap();
        assert_eq!(alerts.len(), 2);
    }
}
