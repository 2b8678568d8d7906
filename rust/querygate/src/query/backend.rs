//! Port to the relational backend that runs gateway queries.

use super::binder::BoundQuery;
use async_trait::async_trait;
use futures_util::{Stream, TryStreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::HashSet, time::Duration};
use thiserror::Error;

/// One result row: column name to JSON scalar (or null), in column order. Keys come
/// from [`unique_column_names`], so repeated select-list names never overwrite each other.
pub type Row = Map<String, Value>;

/// Column name plus the backend's type name, serialized as `{name, type}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to acquire database connection: {0}")]
    Pool(String),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("no value supplied for parameter @{0}")]
    MissingParameter(String),

    #[error("cannot bind parameter @{name} as {expected}: {reason}")]
    Parameter {
        name: String,
        expected: String,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Message suitable for callers; PostgreSQL server errors carry their own text.
    pub fn detail(&self) -> String {
        match self {
            BackendError::Postgres(err) => err
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| err.to_string()),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Runs `query` and returns at most `max_rows` rows. Implementations stream rows and
    /// stop reading once the cap is reached.
    async fn fetch(
        &self,
        query: &BoundQuery,
        timeout: Duration,
        max_rows: usize,
    ) -> Result<RowSet, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;
}

/// Result keys for a select list. A repeated name gets `_2`, `_3`, ... appended,
/// skipping any suffixed name the query already uses.
pub fn unique_column_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let names: Vec<&str> = names.into_iter().collect();
    let mut taken: HashSet<String> = HashSet::with_capacity(names.len());
    let mut keys = Vec::with_capacity(names.len());
    for (idx, name) in names.iter().enumerate() {
        let mut key = name.to_string();
        if taken.contains(&key) {
            let mut n = 2;
            loop {
                key = format!("{name}_{n}");
                if !taken.contains(&key) && !names[idx + 1..].contains(&key.as_str()) {
                    break;
                }
                n += 1;
            }
        }
        taken.insert(key.clone());
        keys.push(key);
    }
    keys
}

/// Drains `rows` until `max_rows` have been collected. Reads one row past the cap to
/// learn whether the result was cut short; anything after that is left unread.
pub async fn collect_rows<S, E>(rows: S, max_rows: usize) -> Result<(Vec<Row>, bool), E>
where
    S: Stream<Item = Result<Row, E>>,
{
    futures_util::pin_mut!(rows);
    let mut collected = Vec::new();
    while let Some(row) = rows.try_next().await? {
        if collected.len() >= max_rows {
            return Ok((collected, true));
        }
        collected.push(row);
    }
    Ok((collected, false))
}
