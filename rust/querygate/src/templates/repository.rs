//! Persistence ports for templates and their tag snapshots.

use crate::models::{QueryTag, QueryTemplate};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("template store connection unavailable: {0}")]
    Pool(String),

    #[error("a template named '{0}' already exists")]
    DuplicateName(String),

    #[error("template {0} is still referenced by tags")]
    StillReferenced(i32),

    #[error("template {0} does not exist")]
    MissingTemplate(i32),

    #[error("sequence {0} is exhausted")]
    SequenceExhausted(&'static str),

    #[error("template store query failed: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Draws the next id from `query_template_id_seq`.
    async fn next_template_id(&self) -> StoreResult<i32>;

    /// Active, non-deprecated template with exactly this name.
    async fn template_by_name(&self, name: &str) -> StoreResult<Option<QueryTemplate>>;

    async fn template_by_id(&self, id: i32) -> StoreResult<Option<QueryTemplate>>;

    /// Ordered by category then name. `active_only` keeps active, non-deprecated rows.
    async fn list_templates(&self, active_only: bool) -> StoreResult<Vec<QueryTemplate>>;

    async fn insert_template(&self, template: &QueryTemplate) -> StoreResult<()>;

    /// Overwrites every mutable column of the row with `template.id`. When
    /// `expected_version` is given the write only applies if the stored version still
    /// equals it. Returns whether a row was written.
    async fn replace_template(
        &self,
        template: &QueryTemplate,
        expected_version: Option<i32>,
    ) -> StoreResult<bool>;

    /// Physical delete. Fails with [`StoreError::StillReferenced`] while tags exist.
    async fn delete_template(&self, id: i32) -> StoreResult<bool>;
}

#[async_trait]
pub trait TagRepository: Send + Sync {
    /// Draws the next id from `query_tag_id_seq`.
    async fn next_tag_id(&self) -> StoreResult<i32>;

    async fn insert_tag(&self, tag: &QueryTag) -> StoreResult<()>;

    /// Newest first.
    async fn tags_for_template(&self, template_id: i32) -> StoreResult<Vec<QueryTag>>;

    async fn tag_by_id(&self, id: i32) -> StoreResult<Option<QueryTag>>;

    async fn delete_tag(&self, id: i32) -> StoreResult<bool>;

    /// Template id to number of tags; templates without tags are absent.
    async fn tag_counts(&self) -> StoreResult<HashMap<i32, i64>>;
}
