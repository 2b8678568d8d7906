//! Versioned query templates and their immutable tag snapshots.

pub mod diff;
pub mod executor;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use executor::{TemplateExecuteRequest, TemplateExecutor};
pub use memory::InMemoryTemplateStore;
pub use postgres::PgTemplateStore;
pub use repository::{StoreError, StoreResult, TagRepository, TemplateRepository};

use crate::{
    error::{Result, ServiceError},
    models::{ChangeType, QueryTag, QueryTemplate, TagSummary, TemplateSummary},
    time::Clock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};

const MAX_NAME_LEN: usize = 200;
const MAX_CATEGORY_LEN: usize = 50;
const OUTPUT_FORMATS: &[&str] = &["json", "csv"];

fn default_params() -> Value {
    Value::Array(Vec::new())
}

fn default_output_format() -> String {
    "json".to_string()
}

const fn default_max_results() -> i32 {
    10_000
}

const fn default_timeout_seconds() -> i32 {
    30
}

const fn default_true() -> bool {
    true
}

/// Create/update payload for a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDto {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub query_sql: String,
    #[serde(default = "default_params")]
    pub params: Value,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_max_results")]
    pub max_results: i32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub deprecated: bool,
    /// Optimistic concurrency guard for updates; ignored on create.
    #[serde(default)]
    pub expected_version: Option<i32>,
}

impl TemplateDto {
    pub fn new(name: impl Into<String>, query_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            category: None,
            query_sql: query_sql.into(),
            params: default_params(),
            output_format: default_output_format(),
            max_results: default_max_results(),
            timeout_seconds: default_timeout_seconds(),
            active: true,
            deprecated: false,
            expected_version: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidRequest("name is required".into()));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(ServiceError::InvalidRequest(format!(
                "name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        if self
            .category
            .as_deref()
            .is_some_and(|category| category.chars().count() > MAX_CATEGORY_LEN)
        {
            return Err(ServiceError::InvalidRequest(format!(
                "category must be at most {MAX_CATEGORY_LEN} characters"
            )));
        }
        if self.query_sql.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("querySql is required".into()));
        }
        if !OUTPUT_FORMATS.contains(&self.output_format.to_ascii_lowercase().as_str()) {
            return Err(ServiceError::InvalidRequest(format!(
                "outputFormat must be one of {}",
                OUTPUT_FORMATS.join(", ")
            )));
        }
        if self.max_results < 1 {
            return Err(ServiceError::InvalidRequest(
                "maxResults must be at least 1".into(),
            ));
        }
        if self.timeout_seconds < 1 {
            return Err(ServiceError::InvalidRequest(
                "timeoutSeconds must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn params(&self) -> Value {
        if self.params.is_null() {
            default_params()
        } else {
            self.params.clone()
        }
    }
}

/// Body of a tag request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRequest {
    #[serde(default)]
    pub change_reason: Option<String>,
    pub change_type: String,
}

impl TagRequest {
    pub fn new(change_type: ChangeType, change_reason: impl Into<String>) -> Self {
        Self {
            change_reason: Some(change_reason.into()),
            change_type: change_type.to_string(),
        }
    }
}

/// Template and tag management over the two repository ports.
#[derive(Clone)]
pub struct TemplateService {
    templates: Arc<dyn TemplateRepository>,
    tags: Arc<dyn TagRepository>,
    clock: Arc<dyn Clock>,
}

impl TemplateService {
    pub fn new(
        templates: Arc<dyn TemplateRepository>,
        tags: Arc<dyn TagRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            templates,
            tags,
            clock,
        }
    }

    /// Both ports served by one store.
    pub fn from_store<S>(store: Arc<S>, clock: Arc<dyn Clock>) -> Self
    where
        S: TemplateRepository + TagRepository + 'static,
    {
        Self::new(store.clone(), store, clock)
    }

    /// Active, non-deprecated template with this name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<QueryTemplate>> {
        self.templates
            .template_by_name(name)
            .await
            .map_err(store_error)
    }

    pub async fn get_by_id(&self, id: i32) -> Result<QueryTemplate> {
        self.templates
            .template_by_id(id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| template_not_found(id))
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<QueryTemplate>> {
        self.templates
            .list_templates(active_only)
            .await
            .map_err(store_error)
    }

    pub async fn list_summaries(&self, active_only: bool) -> Result<Vec<TemplateSummary>> {
        let templates = self.list(active_only).await?;
        let counts = self.tag_counts().await?;
        Ok(templates
            .iter()
            .map(|template| template.summary(counts.get(&template.id).copied().unwrap_or(0)))
            .collect())
    }

    pub async fn create(&self, dto: &TemplateDto) -> Result<QueryTemplate> {
        dto.validate()?;

        let id = self
            .templates
            .next_template_id()
            .await
            .map_err(store_error)?;
        let template = QueryTemplate {
            id,
            name: dto.name.trim().to_string(),
            description: dto.description.clone(),
            category: dto.category.clone(),
            query_sql: dto.query_sql.clone(),
            params: dto.params(),
            output_format: dto.output_format.to_ascii_lowercase(),
            max_results: dto.max_results,
            timeout_seconds: dto.timeout_seconds,
            version: 1,
            creation_date: self.clock.now(),
            update_date: None,
            active: dto.active,
            deprecated: dto.deprecated,
            deprecation_date: dto.deprecated.then(|| self.clock.now()),
        };
        self.templates
            .insert_template(&template)
            .await
            .map_err(store_error)?;

        info!(template_id = id, name = %template.name, "template created");
        Ok(template)
    }

    /// Overwrites the mutable fields. The version moves by one only when the SQL text
    /// changes. Without `expectedVersion` concurrent updates are last-write-wins.
    pub async fn update(&self, id: i32, dto: &TemplateDto) -> Result<QueryTemplate> {
        dto.validate()?;
        let current = self.get_by_id(id).await?;

        if let Some(expected) = dto.expected_version {
            if expected != current.version {
                return Err(version_conflict(id, expected, current.version));
            }
        }

        let now = self.clock.now();
        let sql_changed = current.query_sql != dto.query_sql;
        let deprecation_date = match (current.deprecated, dto.deprecated) {
            (false, true) => Some(now),
            (true, true) => current.deprecation_date,
            (_, false) => None,
        };
        let next = QueryTemplate {
            id,
            name: dto.name.trim().to_string(),
            description: dto.description.clone(),
            category: dto.category.clone(),
            query_sql: dto.query_sql.clone(),
            params: dto.params(),
            output_format: dto.output_format.to_ascii_lowercase(),
            max_results: dto.max_results,
            timeout_seconds: dto.timeout_seconds,
            version: if sql_changed {
                current.version + 1
            } else {
                current.version
            },
            creation_date: current.creation_date,
            update_date: Some(now),
            active: dto.active,
            deprecated: dto.deprecated,
            deprecation_date,
        };

        let written = self
            .templates
            .replace_template(&next, dto.expected_version)
            .await
            .map_err(store_error)?;
        if !written {
            // Either deleted or bumped between the read and the guarded write.
            return match self.templates.template_by_id(id).await.map_err(store_error)? {
                Some(stored) => Err(version_conflict(
                    id,
                    dto.expected_version.unwrap_or(current.version),
                    stored.version,
                )),
                None => Err(template_not_found(id)),
            };
        }

        info!(
            template_id = id,
            version = next.version,
            sql_changed,
            "template updated"
        );
        Ok(next)
    }

    pub async fn delete(&self, id: i32) -> Result<()> {
        self.get_by_id(id).await?;
        if !self
            .templates
            .delete_template(id)
            .await
            .map_err(store_error)?
        {
            return Err(template_not_found(id));
        }
        info!(template_id = id, "template deleted");
        Ok(())
    }

    /// Snapshots the template's current SQL, parameters and version.
    pub async fn create_tag(&self, template_id: i32, request: &TagRequest) -> Result<QueryTag> {
        let change_type: ChangeType = request
            .change_type
            .parse()
            .map_err(ServiceError::InvalidRequest)?;
        let template = self.get_by_id(template_id).await?;

        let previous = self
            .tags
            .tags_for_template(template_id)
            .await
            .map_err(store_error)?;
        let sql_diff = previous
            .first()
            .and_then(|latest| diff::line_diff(&latest.query_sql, &template.query_sql));

        let id = self.tags.next_tag_id().await.map_err(store_error)?;
        let tag = QueryTag {
            id,
            template_id,
            version: template.version,
            query_sql: template.query_sql,
            params: Some(template.params),
            name: Some(template.name),
            description: template.description,
            creation_date: self.clock.now(),
            change_reason: request.change_reason.clone(),
            change_type: Some(change_type.to_string()),
            sql_diff,
        };
        self.tags.insert_tag(&tag).await.map_err(store_error)?;

        info!(
            tag_id = id,
            template_id,
            version = tag.version,
            change_type = %change_type,
            "template tagged"
        );
        Ok(tag)
    }

    pub async fn tags(&self, template_id: i32) -> Result<Vec<TagSummary>> {
        self.get_by_id(template_id).await?;
        let tags = self
            .tags
            .tags_for_template(template_id)
            .await
            .map_err(store_error)?;
        debug!(template_id, count = tags.len(), "listed template tags");
        Ok(tags.iter().map(QueryTag::summary).collect())
    }

    pub async fn tag(&self, id: i32) -> Result<QueryTag> {
        self.tags
            .tag_by_id(id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| tag_not_found(id))
    }

    pub async fn delete_tag(&self, id: i32) -> Result<()> {
        if !self.tags.delete_tag(id).await.map_err(store_error)? {
            return Err(tag_not_found(id));
        }
        info!(tag_id = id, "tag deleted");
        Ok(())
    }

    pub async fn tag_counts(&self) -> Result<HashMap<i32, i64>> {
        self.tags.tag_counts().await.map_err(store_error)
    }
}

fn store_error(err: StoreError) -> ServiceError {
    match err {
        StoreError::DuplicateName(_) => ServiceError::InvalidRequest(err.to_string()),
        StoreError::MissingTemplate(id) => template_not_found(id),
        other => ServiceError::Persistence(other),
    }
}

fn template_not_found(id: i32) -> ServiceError {
    ServiceError::NotFound(format!("template {id} not found"))
}

fn tag_not_found(id: i32) -> ServiceError {
    ServiceError::NotFound(format!("tag {id} not found"))
}

fn version_conflict(id: i32, expected: i32, actual: i32) -> ServiceError {
    warn!(template_id = id, expected, actual, "stale template update");
    ServiceError::Conflict(format!(
        "template {id} is at version {actual}, expected {expected}"
    ))
}
