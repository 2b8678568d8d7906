//! Where container records come from: a configurable query against the operational
//! database, mapped leniently onto [`ContainerRecord`].

use crate::{
    models::ContainerRecord,
    query::{BackendError, BoundQuery, Row, SqlBackend},
};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

pub const SOURCE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to load containers: {}", .0.detail())]
    Backend(#[from] BackendError),
}

#[async_trait]
pub trait ContainerSource: Send + Sync {
    /// Full snapshot of the source of truth.
    async fn load_all(&self) -> Result<Vec<ContainerRecord>, SourceError>;
}

pub struct SqlContainerSource {
    backend: Arc<dyn SqlBackend>,
    query: String,
    timeout: Duration,
}

impl SqlContainerSource {
    pub fn new(backend: Arc<dyn SqlBackend>, query: impl Into<String>) -> Self {
        Self {
            backend,
            query: query.into(),
            timeout: SOURCE_TIMEOUT,
        }
    }
}

#[async_trait]
impl ContainerSource for SqlContainerSource {
    async fn load_all(&self) -> Result<Vec<ContainerRecord>, SourceError> {
        let rows = self
            .backend
            .fetch(&BoundQuery::new(self.query.as_str()), self.timeout, usize::MAX)
            .await?
            .rows;

        let mut records = Vec::with_capacity(rows.len());
        for (position, row) in rows.iter().enumerate() {
            match record_from_row(row) {
                Some(record) => records.push(record),
                None => warn!(position, "skipping container row without a usable id"),
            }
        }
        debug!(rows = rows.len(), records = records.len(), "loaded containers");
        Ok(records)
    }
}

/// Column lookup is case-insensitive. Missing or mistyped columns become `None`; only the
/// id is mandatory.
pub fn record_from_row(row: &Row) -> Option<ContainerRecord> {
    let columns: HashMap<String, &Value> = row
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect();
    let get = |name: &str| columns.get(name).copied().filter(|value| !value.is_null());
    let text = |name: &str| get(name).and_then(as_text);
    let int = |name: &str| get(name).and_then(as_i32);
    let flag = |name: &str| get(name).and_then(as_bool);

    Some(ContainerRecord {
        id: get("id").and_then(as_i64)?,
        code: text("cassa"),
        description: text("descrizione"),
        stanchions: int("piantoni"),
        kind: text("tipo"),
        note: text("nota"),
        is_container: flag("container"),
        is_mobile: flag("mobile"),
        for_scrap: flag("rottami"),
        width: int("larghezza"),
        height: int("altezza"),
        length: int("lunghezza"),
        volume: int("volume"),
        maintenance: text("manutenzione"),
        model: text("modello"),
        serial_number: text("numserie"),
        control_lock: text("controllock"),
        capacity_kg: int("portatakg"),
        tail_lift: flag("sponda"),
        crane: flag("gru"),
        trolleys: flag("carrelli"),
        pallet_truck: flag("transpallet"),
        weighbridge: flag("pesaaponte"),
        plate: text("targa"),
        axles: flag("assali"),
        tyres: flag("pneumatici"),
        checked: flag("ck"),
        check_date: text("ckdata"),
        notice_days: int("giornipre"),
        tare: int("tara"),
        identifier: text("identificativo"),
        photo: text("foto"),
        external_id: None,
    })
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        // NUMERIC columns arrive as strings.
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn as_i32(value: &Value) -> Option<i32> {
    as_i64(value).and_then(|wide| i32::try_from(wide).ok())
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|bit| bit != 0),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "y" => Some(true),
            "0" | "false" | "f" | "n" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::RowSet;
    use serde_json::json;

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn maps_columns_case_insensitively() {
        let record = record_from_row(&row(json!({
            "Id": 12,
            "Cassa": "ab1",
            "PesaAPonte": 1,
            "Sponda": false,
            "Larghezza": "240",
            "CkData": "2024-02-01T00:00:00+00:00",
            "Targa": null,
        })))
        .unwrap();
        assert_eq!(record.id, 12);
        assert_eq!(record.code.as_deref(), Some("ab1"));
        assert_eq!(record.weighbridge, Some(true));
        assert_eq!(record.tail_lift, Some(false));
        assert_eq!(record.width, Some(240));
        assert_eq!(record.check_date.as_deref(), Some("2024-02-01T00:00:00+00:00"));
        assert_eq!(record.plate, None);
        assert_eq!(record.external_id, None);
    }

    #[test]
    fn mistyped_values_become_null() {
        let record = record_from_row(&row(json!({
            "id": 3,
            "gru": "maybe",
            "tara": 5_000_000_000i64,
            "foto": [1, 2],
        })))
        .unwrap();
        assert_eq!(record.crane, None);
        assert_eq!(record.tare, None);
        assert_eq!(record.photo, None);
    }

    #[test]
    fn rows_without_id_are_rejected() {
        assert!(record_from_row(&row(json!({ "cassa": "x" }))).is_none());
        assert!(record_from_row(&row(json!({ "id": null }))).is_none());
    }

    struct FixedRows(Vec<Row>);

    #[async_trait]
    impl SqlBackend for FixedRows {
        async fn fetch(
            &self,
            query: &BoundQuery,
            timeout: Duration,
            _: usize,
        ) -> Result<RowSet, BackendError> {
            assert_eq!(query.sql, "SELECT * FROM containers");
            assert_eq!(timeout, SOURCE_TIMEOUT);
            Ok(RowSet {
                rows: self.0.clone(),
                ..RowSet::default()
            })
        }

        async fn ping(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn load_all_skips_unusable_rows() {
        let backend = FixedRows(vec![
            row(json!({ "id": 1, "cassa": "a" })),
            row(json!({ "cassa": "orphan" })),
            row(json!({ "id": 2 })),
        ]);
        let source = SqlContainerSource::new(Arc::new(backend), "SELECT * FROM containers");
        let ids: Vec<i64> = source
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
