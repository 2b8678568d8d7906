//! Table/view listing and column metadata from `information_schema`.

use super::{
    backend::{Row, SqlBackend},
    binder::BoundQuery,
    executor::ExecutionError,
};
use crate::error::{Result, ServiceError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};
use tracing::info;

const CATALOG_TIMEOUT: Duration = Duration::from_secs(30);
const CATALOG_MAX_ROWS: usize = 100_000;

const LIST_OBJECTS_SQL: &str = "SELECT CAST(table_schema AS text) AS schema, \
     CAST(table_name AS text) AS name, \
     CAST(table_type AS text) AS type \
     FROM information_schema.tables \
     WHERE table_type = CAST(@table_type AS text) \
     AND table_schema NOT IN ('pg_catalog', 'information_schema') \
     ORDER BY table_schema, table_name";

const DESCRIBE_SQL: &str = "SELECT CAST(c.column_name AS text) AS column_name, \
     CAST(c.data_type AS text) AS data_type, \
     CAST(c.character_maximum_length AS integer) AS max_length, \
     CAST(c.is_nullable AS text) = 'YES' AS is_nullable, \
     pk.column_name IS NOT NULL AS is_primary_key, \
     CAST(c.column_default AS text) AS default_value \
     FROM information_schema.columns c \
     JOIN information_schema.tables t \
       ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
     LEFT JOIN ( \
       SELECT ku.table_schema, ku.table_name, ku.column_name \
       FROM information_schema.table_constraints tc \
       JOIN information_schema.key_column_usage ku \
         ON tc.constraint_type = 'PRIMARY KEY' \
        AND tc.constraint_schema = ku.constraint_schema \
        AND tc.constraint_name = ku.constraint_name \
     ) pk ON c.table_schema = pk.table_schema \
         AND c.table_name = pk.table_name \
         AND c.column_name = pk.column_name \
     WHERE c.table_schema = CAST(@schema AS text) \
       AND c.table_name = CAST(@name AS text) \
       AND t.table_type = CAST(@table_type AS text) \
     ORDER BY c.ordinal_position";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
}

impl ObjectKind {
    fn table_type(self) -> &'static str {
        match self {
            ObjectKind::Table => "BASE TABLE",
            ObjectKind::View => "VIEW",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Table => f.write_str("table"),
            ObjectKind::View => f.write_str("view"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    #[serde(rename = "type")]
    pub table_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    #[serde(alias = "column_name")]
    pub column_name: String,
    #[serde(alias = "data_type")]
    pub data_type: String,
    #[serde(alias = "max_length")]
    pub max_length: Option<i32>,
    #[serde(alias = "is_nullable")]
    pub is_nullable: bool,
    #[serde(alias = "is_primary_key")]
    pub is_primary_key: bool,
    #[serde(alias = "default_value")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    pub schema: String,
    pub table_name: String,
    pub columns: Vec<ColumnMetadata>,
}

#[derive(Clone)]
pub struct Catalog {
    backend: Arc<dyn SqlBackend>,
    default_schema: String,
}

impl Catalog {
    pub fn new(backend: Arc<dyn SqlBackend>, default_schema: impl Into<String>) -> Self {
        Self {
            backend,
            default_schema: default_schema.into(),
        }
    }

    pub async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        self.list(ObjectKind::Table).await
    }

    pub async fn list_views(&self) -> Result<Vec<TableInfo>> {
        self.list(ObjectKind::View).await
    }

    async fn list(&self, kind: ObjectKind) -> Result<Vec<TableInfo>> {
        let query = BoundQuery::new(LIST_OBJECTS_SQL).with_param("table_type", kind.table_type());
        let rows = self.rows(&query).await?;
        let objects: Vec<TableInfo> = decode_rows(rows)?;
        info!(kind = %kind, count = objects.len(), "listed catalog objects");
        Ok(objects)
    }

    /// Column metadata for `qualified_name` (`name` or `schema.name`). An explicit
    /// `schema_override` wins over a schema prefix in the name.
    pub async fn describe(
        &self,
        kind: ObjectKind,
        qualified_name: &str,
        schema_override: Option<&str>,
    ) -> Result<TableMetadata> {
        let (prefix, name) = split_qualified(qualified_name);
        let schema = schema_override
            .filter(|schema| !schema.trim().is_empty())
            .or(prefix)
            .unwrap_or(self.default_schema.as_str())
            .to_string();

        let query = BoundQuery::new(DESCRIBE_SQL)
            .with_param("name", name)
            .with_param("schema", schema.as_str())
            .with_param("table_type", kind.table_type());
        let columns: Vec<ColumnMetadata> = decode_rows(self.rows(&query).await?)?;

        if columns.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "{kind} '{schema}.{name}' not found"
            )));
        }

        info!(kind = %kind, %schema, name, columns = columns.len(), "described catalog object");
        Ok(TableMetadata {
            schema,
            table_name: name.to_string(),
            columns,
        })
    }

    async fn rows(&self, query: &BoundQuery) -> Result<Vec<Row>> {
        let result = self
            .backend
            .fetch(query, CATALOG_TIMEOUT, CATALOG_MAX_ROWS)
            .await
            .map_err(|err| ServiceError::Execution(ExecutionError(err)))?;
        Ok(result.rows)
    }
}

fn split_qualified(qualified: &str) -> (Option<&str>, &str) {
    match qualified.split_once('.') {
        Some((schema, name)) if !schema.is_empty() => (Some(schema), name),
        Some((_, name)) => (None, name),
        None => (None, qualified),
    }
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(Value::Object(row)).map_err(|err| {
                ServiceError::Internal(anyhow::anyhow!("unexpected catalog row shape: {err}"))
            })
        })
        .collect()
}
