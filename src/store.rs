use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

pub const BARCODE_TYPE: &str = "Code128";
pub const STATUS_GENERATED: &str = "generated";
pub const STATUS_SCANNED: &str = "scanned";
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PICKED: &str = "picked";

/// Barcodes, pick lists and scan history for the warehouse floor.
pub struct DispatchStore {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarcodeRecord {
    pub order_id: String,
    pub driver_id: String,
    pub pdf_file: String,
    pub page_number: usize,
    pub barcode_type: String,
    pub status: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl BarcodeRecord {
    pub fn new(order_id: &str, driver_id: &str, pdf_file: &str, page_number: usize) -> Self {
        Self {
            order_id: order_id.to_string(),
            driver_id: driver_id.to_string(),
            pdf_file: pdf_file.to_string(),
            page_number,
            barcode_type: BARCODE_TYPE.to_string(),
            status: STATUS_GENERATED.to_string(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// A pick-list row as supplied for import. Codes and sequence are assigned on insert.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NewPickItem {
    pub item_description: String,
    #[serde(default)]
    pub item_code: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub location: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PickItem {
    pub id: i64,
    pub order_id: String,
    pub item_code: String,
    pub item_description: String,
    pub quantity: u32,
    pub quantity_picked: u32,
    pub location: Option<String>,
    pub pick_sequence: u32,
    pub status: String,
    pub picked_by: Option<String>,
    pub picked_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanRecord {
    pub id: i64,
    pub order_id: String,
    pub scanned_by: String,
    pub device_info: Option<String>,
    pub location: Option<String>,
    pub scanned_at: String,
}

impl DispatchStore {
    /// Open (or create) the database at `db_path` and make sure the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS generated_barcodes (
                order_id TEXT PRIMARY KEY,
                driver_id TEXT NOT NULL,
                pdf_file TEXT NOT NULL,
                page_number INTEGER NOT NULL,
                barcode_type TEXT NOT NULL DEFAULT 'Code128',
                status TEXT NOT NULL DEFAULT 'generated',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pick_lists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                item_code TEXT NOT NULL,
                item_description TEXT NOT NULL,
                quantity INTEGER NOT NULL DEFAULT 1,
                quantity_picked INTEGER NOT NULL DEFAULT 0,
                location TEXT,
                pick_sequence INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                picked_by TEXT,
                picked_at DATETIME,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS scan_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                scanned_by TEXT NOT NULL,
                device_info TEXT,
                location TEXT,
                scanned_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_barcodes_driver ON generated_barcodes(driver_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pick_lists_order ON pick_lists(order_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_scan_history_order ON scan_history(order_id)",
            [],
        )?;

        info!("Database initialized successfully");
        Ok(Self { conn })
    }

    /// Insert or refresh barcode records. Returns the number of distinct orders
    /// written; a later record for the same order replaces an earlier one.
    pub fn upsert_barcodes(&mut self, records: &[BarcodeRecord]) -> SqliteResult<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO generated_barcodes
                    (order_id, driver_id, pdf_file, page_number, barcode_type, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(order_id) DO UPDATE SET
                    driver_id = excluded.driver_id,
                    pdf_file = excluded.pdf_file,
                    page_number = excluded.page_number,
                    barcode_type = excluded.barcode_type,
                    updated_at = CURRENT_TIMESTAMP",
            )?;
            for record in records {
                stmt.execute(params![
                    record.order_id,
                    record.driver_id,
                    record.pdf_file,
                    record.page_number as i64,
                    record.barcode_type,
                    record.status,
                ])?;
            }
        }
        tx.commit()?;
        let orders = records
            .iter()
            .map(|r| r.order_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        info!(records = records.len(), orders, "Barcode records stored");
        Ok(orders)
    }

    pub fn get_barcode(&self, order_id: &str) -> SqliteResult<Option<BarcodeRecord>> {
        self.conn
            .query_row(
                "SELECT order_id, driver_id, pdf_file, page_number, barcode_type, status,
                        created_at, updated_at
                 FROM generated_barcodes
                 WHERE order_id = ?1",
                params![order_id],
                |row| {
                    Ok(BarcodeRecord {
                        order_id: row.get(0)?,
                        driver_id: row.get(1)?,
                        pdf_file: row.get(2)?,
                        page_number: row.get::<_, i64>(3)? as usize,
                        barcode_type: row.get(4)?,
                        status: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()
    }

    /// Returns false when no barcode exists for `order_id`.
    pub fn update_barcode_status(&self, order_id: &str, status: &str) -> SqliteResult<bool> {
        let changed = self.conn.execute(
            "UPDATE generated_barcodes
             SET status = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE order_id = ?2",
            params![status, order_id],
        )?;
        if changed == 0 {
            warn!(order = %order_id, "No barcode record to update");
        }
        Ok(changed > 0)
    }

    /// Insert pick items for an order. Missing item codes become `<ORDER>_ITEM_<nnn>`;
    /// pick sequence continues after any rows the order already has.
    pub fn insert_pick_list(
        &mut self,
        order_id: &str,
        items: &[NewPickItem],
    ) -> SqliteResult<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let existing: u32 = tx.query_row(
            "SELECT COALESCE(MAX(pick_sequence), 0) FROM pick_lists WHERE order_id = ?1",
            params![order_id],
            |row| row.get(0),
        )?;

        let mut ids = Vec::with_capacity(items.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO pick_lists
                    (order_id, item_code, item_description, quantity, location, pick_sequence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (offset, item) in items.iter().enumerate() {
                let sequence = existing + offset as u32 + 1;
                let code = match item.item_code.as_deref().map(str::trim) {
                    Some(code) if !code.is_empty() => code.to_string(),
                    _ => format!("{order_id}_ITEM_{sequence:03}"),
                };
                stmt.execute(params![
                    order_id,
                    code,
                    item.item_description,
                    item.quantity,
                    item.location,
                    sequence,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        info!(order = %order_id, items = ids.len(), "Pick list stored");
        Ok(ids)
    }

    pub fn pick_list_for_order(&self, order_id: &str) -> SqliteResult<Vec<PickItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, order_id, item_code, item_description, quantity, quantity_picked,
                    location, pick_sequence, status, picked_by, picked_at
             FROM pick_lists
             WHERE order_id = ?1
             ORDER BY pick_sequence, id",
        )?;
        let rows = stmt.query_map(params![order_id], |row| {
            Ok(PickItem {
                id: row.get(0)?,
                order_id: row.get(1)?,
                item_code: row.get(2)?,
                item_description: row.get(3)?,
                quantity: row.get(4)?,
                quantity_picked: row.get(5)?,
                location: row.get(6)?,
                pick_sequence: row.get(7)?,
                status: row.get(8)?,
                picked_by: row.get(9)?,
                picked_at: row.get(10)?,
            })
        })?;
        rows.collect()
    }

    /// Record a pick. Returns false when the item does not exist.
    pub fn update_pick_item(
        &self,
        item_id: i64,
        quantity_picked: u32,
        picked_by: &str,
    ) -> SqliteResult<bool> {
        let changed = self.conn.execute(
            "UPDATE pick_lists
             SET quantity_picked = ?1, picked_by = ?2, status = ?3, picked_at = CURRENT_TIMESTAMP
             WHERE id = ?4",
            params![quantity_picked, picked_by, STATUS_PICKED, item_id],
        )?;
        info!(item = item_id, quantity_picked, picked_by = %picked_by, "Pick recorded");
        Ok(changed > 0)
    }

    /// Log a scan and mark the order's barcode as scanned.
    pub fn record_scan(
        &mut self,
        order_id: &str,
        scanned_by: &str,
        device_info: Option<&str>,
        location: Option<&str>,
    ) -> SqliteResult<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO scan_history (order_id, scanned_by, device_info, location)
             VALUES (?1, ?2, ?3, ?4)",
            params![order_id, scanned_by, device_info, location],
        )?;
        let id = tx.last_insert_rowid();
        let marked = tx.execute(
            "UPDATE generated_barcodes
             SET status = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE order_id = ?2",
            params![STATUS_SCANNED, order_id],
        )?;
        tx.commit()?;

        if marked == 0 {
            warn!(order = %order_id, "Scanned order has no barcode record");
        }
        info!(order = %order_id, scanned_by = %scanned_by, "Scan recorded");
        Ok(id)
    }

    /// Scans for `order_id`, newest first.
    pub fn scan_history(&self, order_id: &str) -> SqliteResult<Vec<ScanRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, order_id, scanned_by, device_info, location, scanned_at
             FROM scan_history
             WHERE order_id = ?1
             ORDER BY scanned_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![order_id], |row| {
            Ok(ScanRecord {
                id: row.get(0)?,
                order_id: row.get(1)?,
                scanned_by: row.get(2)?,
                device_info: row.get(3)?,
                location: row.get(4)?,
                scanned_at: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    /// (barcodes, scanned barcodes, pick items, picked items)
    pub fn get_counts(&self) -> SqliteResult<(usize, usize, usize, usize)> {
        let barcodes: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM generated_barcodes", [], |row| row.get(0))?;

        let scanned: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM generated_barcodes WHERE status = ?1",
            params![STATUS_SCANNED],
            |row| row.get(0),
        )?;

        let items: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM pick_lists", [], |row| row.get(0))?;

        let picked: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM pick_lists WHERE status = ?1",
            params![STATUS_PICKED],
            |row| row.get(0),
        )?;

        Ok((barcodes, scanned, items, picked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(description: &str, code: Option<&str>) -> NewPickItem {
        NewPickItem {
            item_description: description.to_string(),
            item_code: code.map(str::to_string),
            quantity: 2,
            location: Some("A-01".to_string()),
        }
    }

    #[test]
    fn test_barcode_upsert_keeps_one_row_per_order() {
        let mut store = DispatchStore::in_memory().unwrap();
        store
            .upsert_barcodes(&[BarcodeRecord::new("A060JR7", "D1", "Driver_D1.pdf", 1)])
            .unwrap();
        store
            .upsert_barcodes(&[BarcodeRecord::new("A060JR7", "D2", "Driver_D2.pdf", 4)])
            .unwrap();

        let record = store.get_barcode("A060JR7").unwrap().unwrap();
        assert_eq!(record.driver_id, "D2");
        assert_eq!(record.page_number, 4);
        assert_eq!(record.barcode_type, BARCODE_TYPE);
        assert_eq!(record.status, STATUS_GENERATED);
        assert_eq!(store.get_counts().unwrap().0, 1);
        assert!(store.get_barcode("B900ZZ1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_counts_distinct_orders() {
        let mut store = DispatchStore::in_memory().unwrap();
        let written = store
            .upsert_barcodes(&[
                BarcodeRecord::new("A060JR7", "D1", "Driver_D1.pdf", 1),
                BarcodeRecord::new("A060JR7", "D1", "Driver_D1.pdf", 2),
                BarcodeRecord::new("B900ZZ1", "D2", "Driver_D2.pdf", 1),
            ])
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(store.get_counts().unwrap().0, 2);
        assert_eq!(store.get_barcode("A060JR7").unwrap().unwrap().page_number, 2);
    }

    #[test]
    fn test_scan_marks_barcode_and_lists_newest_first() {
        let mut store = DispatchStore::in_memory().unwrap();
        store
            .upsert_barcodes(&[BarcodeRecord::new("A060JR7", "D1", "Driver_D1.pdf", 1)])
            .unwrap();

        let first = store.record_scan("A060JR7", "alex", Some("handheld-3"), None).unwrap();
        let second = store.record_scan("A060JR7", "sam", None, Some("Bay 4")).unwrap();

        assert_eq!(store.get_barcode("A060JR7").unwrap().unwrap().status, STATUS_SCANNED);
        let history = store.scan_history("A060JR7").unwrap();
        assert_eq!(history.iter().map(|s| s.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(history[0].location.as_deref(), Some("Bay 4"));
        assert!(store.scan_history("B900ZZ1").unwrap().is_empty());
    }

    #[test]
    fn test_pick_list_codes_and_sequence() {
        let mut store = DispatchStore::in_memory().unwrap();
        store
            .insert_pick_list("A060JR7", &[item("Bolts", None), item("Nuts", Some("NUT-9"))])
            .unwrap();
        store.insert_pick_list("A060JR7", &[item("Washers", Some("  "))]).unwrap();

        let items = store.pick_list_for_order("A060JR7").unwrap();
        assert_eq!(
            items.iter().map(|i| i.item_code.as_str()).collect::<Vec<_>>(),
            vec!["A060JR7_ITEM_001", "NUT-9", "A060JR7_ITEM_003"]
        );
        assert_eq!(items.iter().map(|i| i.pick_sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(items.iter().all(|i| i.status == STATUS_PENDING));
    }

    #[test]
    fn test_update_pick_item() {
        let mut store = DispatchStore::in_memory().unwrap();
        let ids = store.insert_pick_list("B900ZZ1", &[item("Tape", None)]).unwrap();

        assert!(store.update_pick_item(ids[0], 2, "jo").unwrap());
        assert!(!store.update_pick_item(9999, 1, "jo").unwrap());

        let picked = &store.pick_list_for_order("B900ZZ1").unwrap()[0];
        assert_eq!(picked.status, STATUS_PICKED);
        assert_eq!(picked.quantity_picked, 2);
        assert_eq!(picked.picked_by.as_deref(), Some("jo"));
        assert!(picked.picked_at.is_some());
        assert_eq!(store.get_counts().unwrap(), (0, 0, 1, 1));
    }

    #[test]
    fn test_store_on_disk_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.db");
        {
            let mut store = DispatchStore::new(&path).unwrap();
            store
                .upsert_barcodes(&[BarcodeRecord::new("A060JR7", "D1", "x.pdf", 1)])
                .unwrap();
        }
        let store = DispatchStore::new(&path).unwrap();
        assert!(store.update_barcode_status("A060JR7", STATUS_SCANNED).unwrap());
        assert!(!store.update_barcode_status("NOPE", STATUS_SCANNED).unwrap());
    }
}
