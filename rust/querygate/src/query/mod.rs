//! Ad-hoc query path: validation, named-parameter binding and execution.

pub mod backend;
pub mod binder;
pub mod catalog;
pub mod executor;
pub mod postgres;
pub mod validator;

pub use backend::{BackendError, ColumnInfo, Row, RowSet, SqlBackend};
pub use binder::{bind, BoundParam, BoundQuery, ParamValue};
pub use executor::{ExecutionError, ExecutionLimits, PagedResult, QueryExecutor, QueryResponse};
pub use validator::{QueryValidator, ValidationError};

use crate::{
    config::QuerySettings,
    error::{Result, ServiceError},
    pagination::{PageParams, PageRequest},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

#[derive(Clone)]
pub struct QueryService {
    validator: QueryValidator,
    executor: QueryExecutor,
    limits: ExecutionLimits,
}

impl QueryService {
    pub fn new(settings: &QuerySettings, executor: QueryExecutor) -> Self {
        Self {
            validator: QueryValidator::from_settings(settings),
            executor,
            limits: ExecutionLimits::from_settings(settings),
        }
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    pub async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let bound = self.prepare(request)?;
        let response = self
            .executor
            .execute(&bound, self.limits)
            .await
            .map_err(ServiceError::QueryFailed)?;

        info!(
            rows = response.row_count,
            execution_time_ms = response.execution_time_ms,
            "ad-hoc query executed"
        );
        Ok(response)
    }

    pub async fn execute_paged(
        &self,
        request: &QueryRequest,
        params: PageParams,
    ) -> Result<PagedResult> {
        let page = PageRequest::new(params, self.limits.max_rows)?;
        let bound = self.prepare(request)?;
        let result = self
            .executor
            .execute_paged(&bound, page, self.limits)
            .await
            .map_err(ServiceError::QueryFailed)?;

        info!(
            page = result.page,
            page_size = result.page_size,
            total_count = result.total_count,
            "ad-hoc paged query executed"
        );
        Ok(result)
    }

    fn prepare(&self, request: &QueryRequest) -> Result<BoundQuery> {
        if let Err(err) = self.validator.validate(&request.query) {
            warn!(error = %err, "rejected ad-hoc query");
            return Err(ServiceError::Validation(err));
        }
        Ok(bind(&request.query, &request.parameters))
    }
}
