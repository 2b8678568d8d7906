use super::TemplateService;
use crate::{
    error::{Result, ServiceError},
    query::{bind, ExecutionLimits, QueryExecutor, QueryResponse},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateExecuteRequest {
    pub template_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

/// Runs stored templates by name. Stored SQL skips the ad-hoc validator; templates are
/// vetted when they are authored.
#[derive(Clone)]
pub struct TemplateExecutor {
    templates: TemplateService,
    executor: QueryExecutor,
    defaults: ExecutionLimits,
}

impl TemplateExecutor {
    pub fn new(
        templates: TemplateService,
        executor: QueryExecutor,
        defaults: ExecutionLimits,
    ) -> Self {
        Self {
            templates,
            executor,
            defaults,
        }
    }

    pub async fn execute_by_name(
        &self,
        name: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<QueryResponse> {
        let Some(template) = self.templates.get_by_name(name).await? else {
            warn!(template = name, "template not found or inactive");
            return Err(ServiceError::TemplateNotFound(name.to_string()));
        };

        let bound = bind(&template.query_sql, parameters);
        let limits = self
            .defaults
            .with_overrides(template.timeout_seconds, template.max_results);

        let response = self.executor.execute(&bound, limits).await.map_err(|err| {
            error!(
                template = name,
                template_id = template.id,
                error = %err,
                "template execution failed"
            );
            ServiceError::Execution(err)
        })?;

        info!(
            template = name,
            version = template.version,
            rows = response.row_count,
            execution_time_ms = response.execution_time_ms,
            "template executed"
        );
        Ok(response)
    }

    pub async fn execute(&self, request: &TemplateExecuteRequest) -> Result<QueryResponse> {
        self.execute_by_name(&request.template_name, &request.parameters)
            .await
    }
}
