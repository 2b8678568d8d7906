use super::{
    backend::{BackendError, ColumnInfo, Row, RowSet, SqlBackend},
    binder::BoundQuery,
};
use crate::{config::QuerySettings, pagination::PageRequest};
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("query execution failed: {}", .0.detail())]
pub struct ExecutionError(#[from] pub BackendError);

impl ExecutionError {
    pub fn detail(&self) -> String {
        self.0.detail()
    }
}

/// Per-call statement timeout and row cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub max_rows: usize,
}

impl ExecutionLimits {
    pub fn from_settings(settings: &QuerySettings) -> Self {
        Self {
            timeout: settings.timeout,
            max_rows: settings.max_rows,
        }
    }

    /// Template overrides apply only when positive.
    pub fn with_overrides(self, timeout_seconds: i32, max_results: i32) -> Self {
        Self {
            timeout: if timeout_seconds > 0 {
                Duration::from_secs(timeout_seconds as u64)
            } else {
                self.timeout
            },
            max_rows: if max_results > 0 {
                max_results as usize
            } else {
                self.max_rows
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub data: Vec<Row>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub columns: Vec<ColumnInfo>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult {
    pub page: u64,
    pub page_size: u64,
    pub total_count: u64,
    pub total_pages: u64,
    pub data: Vec<Row>,
}

#[derive(Clone)]
pub struct QueryExecutor {
    backend: Arc<dyn SqlBackend>,
}

impl QueryExecutor {
    pub fn new(backend: Arc<dyn SqlBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn SqlBackend> {
        &self.backend
    }

    pub async fn execute(
        &self,
        query: &BoundQuery,
        limits: ExecutionLimits,
    ) -> Result<QueryResponse, ExecutionError> {
        let started = Instant::now();
        let result = self
            .backend
            .fetch(query, limits.timeout, limits.max_rows)
            .await?;
        let execution_time_ms = elapsed_ms(started);

        debug!(
            rows = result.rows.len(),
            truncated = result.truncated,
            execution_time_ms,
            "query executed"
        );

        Ok(QueryResponse {
            row_count: result.rows.len(),
            data: result.rows,
            execution_time_ms,
            columns: result.columns,
            truncated: result.truncated,
        })
    }

    /// Runs a count over the wrapped statement, then fetches one page of it. Both
    /// statements bind the same parameters.
    pub async fn execute_paged(
        &self,
        query: &BoundQuery,
        page: PageRequest,
        limits: ExecutionLimits,
    ) -> Result<PagedResult, ExecutionError> {
        let count_query = query.with_sql(count_sql(&query.sql));
        let counted = self.backend.fetch(&count_query, limits.timeout, 1).await?;
        let total_count = total_from(&counted)?;

        let page_query = query.with_sql(page_sql(&query.sql, &page));
        let fetched = self
            .backend
            .fetch(&page_query, limits.timeout, page.size() as usize)
            .await?;

        debug!(
            page = page.page(),
            page_size = page.size(),
            total_count,
            "paged query executed"
        );

        Ok(PagedResult {
            page: page.page(),
            page_size: page.size(),
            total_count,
            total_pages: page.total_pages(total_count),
            data: fetched.rows,
        })
    }
}

/// The single value of a `COUNT(*)` result.
fn total_from(counted: &RowSet) -> Result<u64, BackendError> {
    let value = counted
        .rows
        .first()
        .and_then(|row| row.values().next())
        .ok_or_else(|| BackendError::Other("count query returned no rows".into()))?;
    value.as_u64().ok_or_else(|| {
        BackendError::Other(format!(
            "count query returned {value} instead of a non-negative integer"
        ))
    })
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

pub fn count_sql(sql: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM ({}) AS count_query",
        strip_terminator(sql)
    )
}

pub fn page_sql(sql: &str, page: &PageRequest) -> String {
    format!(
        "{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
        strip_terminator(sql),
        page.offset(),
        page.size()
    )
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pagination::PageParams, query::backend::RowSet};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Serves a fixed integer table `t(id)` and records every statement it sees.
    struct TableBackend {
        ids: Vec<i64>,
        seen: Mutex<Vec<(String, Duration, usize)>>,
    }

    impl TableBackend {
        fn new(count: i64) -> Self {
            Self {
                ids: (1..=count).collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SqlBackend for TableBackend {
        async fn fetch(
            &self,
            query: &BoundQuery,
            timeout: Duration,
            max_rows: usize,
        ) -> Result<RowSet, BackendError> {
            self.seen
                .lock()
                .push((query.sql.clone(), timeout, max_rows));

            if query.sql.starts_with("SELECT COUNT(*)") {
                let mut row = Row::new();
                row.insert("count".into(), json!(self.ids.len()));
                return Ok(RowSet {
                    columns: vec![ColumnInfo {
                        name: "count".into(),
                        data_type: "int8".into(),
                    }],
                    rows: vec![row],
                    truncated: false,
                });
            }

            let (offset, fetch) = match query.sql.split_once(" OFFSET ") {
                Some((_, tail)) => {
                    let parts: Vec<&str> = tail.split_whitespace().collect();
                    (parts[0].parse().unwrap(), parts[4].parse().unwrap())
                }
                None => (0usize, usize::MAX),
            };

            let window: Vec<i64> = self.ids.iter().copied().skip(offset).take(fetch).collect();
            let truncated = window.len() > max_rows;
            let rows = window
                .into_iter()
                .take(max_rows)
                .map(|id| {
                    let mut row = Row::new();
                    row.insert("id".into(), json!(id));
                    row
                })
                .collect();

            Ok(RowSet {
                columns: vec![ColumnInfo {
                    name: "id".into(),
                    data_type: "int8".into(),
                }],
                rows,
                truncated,
            })
        }

        async fn ping(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl SqlBackend for FailingBackend {
        async fn fetch(
            &self,
            _: &BoundQuery,
            _: Duration,
            _: usize,
        ) -> Result<RowSet, BackendError> {
            Err(BackendError::Other("relation \"nope\" does not exist".into()))
        }

        async fn ping(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    /// Answers every statement with one `count` row holding `value`.
    struct CountBackend(serde_json::Value);

    #[async_trait]
    impl SqlBackend for CountBackend {
        async fn fetch(
            &self,
            _: &BoundQuery,
            _: Duration,
            _: usize,
        ) -> Result<RowSet, BackendError> {
            let mut row = Row::new();
            row.insert("count".into(), self.0.clone());
            Ok(RowSet {
                columns: vec![ColumnInfo {
                    name: "count".into(),
                    data_type: "numeric".into(),
                }],
                rows: vec![row],
                truncated: false,
            })
        }

        async fn ping(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn limits(max_rows: usize) -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_secs(30),
            max_rows,
        }
    }

    fn ids(rows: &[Row]) -> Vec<i64> {
        rows.iter().map(|row| row["id"].as_i64().unwrap()).collect()
    }

    #[tokio::test]
    async fn execute_reports_rows_and_columns() {
        let executor = QueryExecutor::new(Arc::new(TableBackend::new(3)));
        let response = executor
            .execute(&BoundQuery::new("SELECT id FROM t"), limits(100))
            .await
            .unwrap();

        assert_eq!(response.row_count, 3);
        assert_eq!(ids(&response.data), vec![1, 2, 3]);
        assert_eq!(response.columns[0].name, "id");
        assert!(!response.truncated);
    }

    #[tokio::test]
    async fn execute_caps_rows_and_flags_truncation() {
        let executor = QueryExecutor::new(Arc::new(TableBackend::new(50)));
        let response = executor
            .execute(&BoundQuery::new("SELECT id FROM t"), limits(10))
            .await
            .unwrap();

        assert_eq!(response.row_count, 10);
        assert!(response.truncated);
    }

    #[tokio::test]
    async fn execute_wraps_backend_failures() {
        let executor = QueryExecutor::new(Arc::new(FailingBackend));
        let err = executor
            .execute(&BoundQuery::new("SELECT * FROM nope"), limits(10))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "query execution failed: relation \"nope\" does not exist"
        );
    }

    #[tokio::test]
    async fn second_page_of_twenty_five() {
        let backend = Arc::new(TableBackend::new(25));
        let executor = QueryExecutor::new(backend.clone());
        let page = PageRequest::new(
            PageParams {
                page: 2,
                page_size: 10,
            },
            1000,
        )
        .unwrap();

        let result = executor
            .execute_paged(&BoundQuery::new("SELECT id FROM t;"), page, limits(1000))
            .await
            .unwrap();

        assert_eq!(result.page, 2);
        assert_eq!(result.page_size, 10);
        assert_eq!(result.total_count, 25);
        assert_eq!(result.total_pages, 3);
        assert_eq!(ids(&result.data), (11..=20).collect::<Vec<_>>());

        let seen = backend.seen.lock();
        assert_eq!(
            seen[0].0,
            "SELECT COUNT(*) FROM (SELECT id FROM t) AS count_query"
        );
        assert_eq!(
            seen[1].0,
            "SELECT id FROM t OFFSET 10 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[tokio::test]
    async fn paged_parameters_are_shared_by_both_statements() {
        struct Recording(Mutex<Vec<BoundQuery>>);

        #[async_trait]
        impl SqlBackend for Recording {
            async fn fetch(
                &self,
                query: &BoundQuery,
                _: Duration,
                _: usize,
            ) -> Result<RowSet, BackendError> {
                self.0.lock().push(query.clone());
                Ok(RowSet::default())
            }

            async fn ping(&self) -> Result<(), BackendError> {
                Ok(())
            }
        }

        let backend = Arc::new(Recording(Mutex::new(Vec::new())));
        let executor = QueryExecutor::new(backend.clone());
        let query = BoundQuery::new("SELECT * FROM t WHERE a = @a").with_param("a", 7i64);
        let result = executor
            .execute_paged(&query, PageRequest::new(PageParams::default(), 100).unwrap(), limits(100))
            .await
            .unwrap();

        assert_eq!(result.total_count, 0);
        assert_eq!(result.total_pages, 0);
        let seen = backend.0.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|bound| bound.params == query.params));
    }

    #[test]
    fn template_overrides_only_when_positive() {
        let defaults = limits(1000);
        assert_eq!(
            defaults.with_overrides(5, 50),
            ExecutionLimits {
                timeout: Duration::from_secs(5),
                max_rows: 50,
            }
        );
        assert_eq!(defaults.with_overrides(0, -1), defaults);
    }

    #[tokio::test]
    async fn undecodable_counts_fail_the_paged_query() {
        let page = PageRequest::new(PageParams::default(), 100).unwrap();
        for count in [json!("12"), json!(-1), json!(2.5), serde_json::Value::Null] {
            let executor = QueryExecutor::new(Arc::new(CountBackend(count.clone())));
            let err = executor
                .execute_paged(&BoundQuery::new("SELECT id FROM t"), page, limits(100))
                .await
                .unwrap_err();
            assert!(
                err.detail().starts_with("count query returned"),
                "count {count} gave {err}"
            );
        }
    }
}
