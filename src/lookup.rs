// src/lookup.rs

use crate::error::LookupError;
use crate::extract::OrderIdentifier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Sequence used for stop numbers that are not numeric; sorts last.
pub const UNKNOWN_SEQUENCE: u32 = u32::MAX;

/// Driver and delivery position for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupEntry {
    pub order_id: OrderIdentifier,
    pub driver_id: String,
    pub sequence_number: u32,
}

/// One row of external delivery-sequence data.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryRecord {
    #[serde(alias = "order_number", alias = "Order ID")]
    pub order_id: String,
    #[serde(alias = "driver_number", alias = "driver", deserialize_with = "text_or_number")]
    pub driver_id: String,
    #[serde(
        alias = "stop_number",
        alias = "sequence",
        default,
        deserialize_with = "text_or_number"
    )]
    pub sequence_number: String,
}

impl DeliveryRecord {
    pub fn new(order_id: &str, driver_id: &str, sequence_number: u32) -> Self {
        Self {
            order_id: order_id.to_string(),
            driver_id: driver_id.to_string(),
            sequence_number: sequence_number.to_string(),
        }
    }
}

/// Stop numbers and driver numbers arrive as either JSON strings or numbers.
fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
        Null,
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s.trim().to_string(),
        Raw::Int(n) => n.to_string(),
        // Spreadsheet exports turn 3 into 3.0
        Raw::Float(f) if f.fract() == 0.0 => format!("{}", f as i64),
        Raw::Float(f) => f.to_string(),
        Raw::Null => String::new(),
    })
}

/// Cached delivery data written by the older desktop tool.
#[derive(Deserialize)]
struct LegacyCache {
    #[serde(default)]
    delivery_sequences: Vec<String>,
    delivery_data_with_drivers: HashMap<String, LegacyDriverData>,
}

#[derive(Deserialize)]
struct LegacyDriverData {
    #[serde(default, deserialize_with = "text_or_number")]
    stop_number: String,
    #[serde(deserialize_with = "text_or_number")]
    driver_number: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LookupFile {
    Records(Vec<DeliveryRecord>),
    Legacy(LegacyCache),
}

/// Read-only index from order identifier to driver and sequence.
#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    entries: HashMap<OrderIdentifier, LookupEntry>,
}

impl LookupTable {
    /// Index `rows`; later rows for the same order replace earlier ones.
    pub fn build<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = DeliveryRecord>,
    {
        let mut entries = HashMap::new();
        let mut skipped = 0usize;
        let mut overwritten = 0usize;

        for row in rows {
            let driver_id = row.driver_id.trim();
            let Some(order_id) = OrderIdentifier::normalize(&row.order_id) else {
                skipped += 1;
                continue;
            };
            if driver_id.is_empty() {
                skipped += 1;
                continue;
            }

            let sequence_number = parse_sequence(&row.sequence_number);
            let entry = LookupEntry {
                order_id: order_id.clone(),
                driver_id: driver_id.to_string(),
                sequence_number,
            };
            if let Some(previous) = entries.insert(order_id, entry) {
                overwritten += 1;
                warn!(
                    order = %previous.order_id,
                    previous_driver = %previous.driver_id,
                    driver = %driver_id,
                    "Duplicate order in delivery data, keeping the later row"
                );
            }
        }

        info!(
            orders = entries.len(),
            skipped, overwritten, "Built delivery lookup table"
        );
        Self { entries }
    }

    /// Load a JSON record list, or the legacy `delivery_data_with_drivers` cache.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LookupError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| LookupError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, LookupError> {
        match serde_json::from_str::<LookupFile>(content)? {
            LookupFile::Records(rows) => Ok(Self::build(rows)),
            LookupFile::Legacy(cache) => Ok(Self::build(legacy_rows(cache))),
        }
    }

    pub fn resolve(&self, identifier: &OrderIdentifier) -> Option<&LookupEntry> {
        self.entries.get(identifier)
    }

    /// Resolve a raw, un-normalised order string.
    pub fn resolve_str(&self, raw: &str) -> Option<&LookupEntry> {
        OrderIdentifier::normalize(raw).and_then(|id| self.entries.get(&id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of orders per driver, for the startup log.
    pub fn orders_per_driver(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.driver_id.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

fn parse_sequence(raw: &str) -> u32 {
    raw.trim().parse::<u32>().unwrap_or_else(|_| {
        if !raw.trim().is_empty() {
            warn!(stop = %raw, "Non-numeric stop number, ordering it last");
        }
        UNKNOWN_SEQUENCE
    })
}

/// Keep the cache's recorded row order so last-write-wins still means something.
fn legacy_rows(mut cache: LegacyCache) -> Vec<DeliveryRecord> {
    let mut rows = Vec::with_capacity(cache.delivery_data_with_drivers.len());
    for order_id in &cache.delivery_sequences {
        if let Some(data) = cache.delivery_data_with_drivers.remove(order_id) {
            rows.push(DeliveryRecord {
                order_id: order_id.clone(),
                driver_id: data.driver_number,
                sequence_number: data.stop_number,
            });
        }
    }
    // Anything not listed in `delivery_sequences`, in key order.
    let mut rest: Vec<_> = cache.delivery_data_with_drivers.into_iter().collect();
    rest.sort_by(|a, b| a.0.cmp(&b.0));
    rows.extend(rest.into_iter().map(|(order_id, data)| DeliveryRecord {
        order_id,
        driver_id: data.driver_number,
        sequence_number: data.stop_number,
    }));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = LookupTable::build(vec![DeliveryRecord::new(" a060jr7 ", "D1", 1)]);
        let lower = table.resolve_str("a060jr7").unwrap();
        let upper = table.resolve_str("A060JR7").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(upper.driver_id, "D1");
        assert_eq!(upper.sequence_number, 1);
    }

    #[test]
    fn test_duplicate_rows_last_wins() {
        let table = LookupTable::build(vec![
            DeliveryRecord::new("A060JR7", "D1", 1),
            DeliveryRecord::new("a060jr7", "D2", 7),
        ]);
        assert_eq!(table.len(), 1);
        let entry = table.resolve_str("A060JR7").unwrap();
        assert_eq!(entry.driver_id, "D2");
        assert_eq!(entry.sequence_number, 7);
    }

    #[test]
    fn test_rows_without_order_or_driver_are_skipped() {
        let table = LookupTable::build(vec![
            DeliveryRecord::new("", "D1", 1),
            DeliveryRecord::new("B900ZZ1", "  ", 2),
            DeliveryRecord::new("C123AB4", "D3", 3),
        ]);
        assert_eq!(table.len(), 1);
        assert!(table.resolve_str("B900ZZ1").is_none());
    }

    #[test]
    fn test_json_records_with_mixed_types() {
        let table = LookupTable::from_json_str(
            r#"[
                {"order_id": "A060JR7", "driver_number": 4, "stop_number": "2"},
                {"order_id": "B900ZZ1", "driver_id": "D9", "sequence_number": 3.0},
                {"order_id": "C123AB4", "driver_id": "D9", "sequence_number": "n/a"}
            ]"#,
        )
        .unwrap();
        assert_eq!(table.resolve_str("a060jr7").unwrap().driver_id, "4");
        assert_eq!(table.resolve_str("a060jr7").unwrap().sequence_number, 2);
        assert_eq!(table.resolve_str("B900ZZ1").unwrap().sequence_number, 3);
        assert_eq!(
            table.resolve_str("C123AB4").unwrap().sequence_number,
            UNKNOWN_SEQUENCE
        );
        assert_eq!(table.orders_per_driver().get("D9"), Some(&2));
    }

    #[test]
    fn test_legacy_cache_format() {
        let table = LookupTable::from_json_str(
            r#"{
                "delivery_sequences": ["A060JR7", "B900ZZ1"],
                "delivery_data_with_drivers": {
                    "A060JR7": {"stop_number": "1", "driver_number": "12"},
                    "B900ZZ1": {"stop_number": "5", "driver_number": "7"}
                },
                "source_file": "deliveries.xlsx",
                "total_records": 2
            }"#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve_str("b900zz1").unwrap().driver_id, "7");
        assert_eq!(table.resolve_str("b900zz1").unwrap().sequence_number, 5);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            LookupTable::from_json_str("{not json"),
            Err(LookupError::Json(_))
        ));
    }
}
