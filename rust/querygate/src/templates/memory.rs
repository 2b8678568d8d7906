//! In-process template and tag store with the same constraints as the database schema:
//! unique template names, restrict-on-delete from tags to templates, independent id
//! sequences.

use super::repository::{StoreError, StoreResult, TagRepository, TemplateRepository};
use crate::models::{QueryTag, QueryTemplate};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
pub struct InMemoryTemplateStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    templates: BTreeMap<i32, QueryTemplate>,
    tags: BTreeMap<i32, QueryTag>,
    template_seq: i32,
    tag_seq: i32,
}

impl Inner {
    fn name_taken(&self, name: &str, except: i32) -> bool {
        self.templates
            .values()
            .any(|template| template.id != except && template.name == name)
    }
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateStore {
    async fn next_template_id(&self) -> StoreResult<i32> {
        let mut inner = self.inner.lock();
        inner.template_seq = inner
            .template_seq
            .checked_add(1)
            .ok_or(StoreError::SequenceExhausted("query_template_id_seq"))?;
        Ok(inner.template_seq)
    }

    async fn template_by_name(&self, name: &str) -> StoreResult<Option<QueryTemplate>> {
        Ok(self
            .inner
            .lock()
            .templates
            .values()
            .find(|template| template.name == name && template.is_executable())
            .cloned())
    }

    async fn template_by_id(&self, id: i32) -> StoreResult<Option<QueryTemplate>> {
        Ok(self.inner.lock().templates.get(&id).cloned())
    }

    async fn list_templates(&self, active_only: bool) -> StoreResult<Vec<QueryTemplate>> {
        let mut templates: Vec<QueryTemplate> = self
            .inner
            .lock()
            .templates
            .values()
            .filter(|template| !active_only || template.is_executable())
            .cloned()
            .collect();
        // NULL categories sort last, as in PostgreSQL ascending order.
        templates.sort_by(|a, b| {
            (a.category.is_none(), &a.category, &a.name).cmp(&(
                b.category.is_none(),
                &b.category,
                &b.name,
            ))
        });
        Ok(templates)
    }

    async fn insert_template(&self, template: &QueryTemplate) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.templates.contains_key(&template.id) || inner.name_taken(&template.name, template.id)
        {
            return Err(StoreError::DuplicateName(template.name.clone()));
        }
        inner.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn replace_template(
        &self,
        template: &QueryTemplate,
        expected_version: Option<i32>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.templates.get(&template.id) else {
            return Ok(false);
        };
        if expected_version.is_some_and(|version| version != current.version) {
            return Ok(false);
        }
        if inner.name_taken(&template.name, template.id) {
            return Err(StoreError::DuplicateName(template.name.clone()));
        }
        inner.templates.insert(template.id, template.clone());
        Ok(true)
    }

    async fn delete_template(&self, id: i32) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        if inner.tags.values().any(|tag| tag.template_id == id) {
            return Err(StoreError::StillReferenced(id));
        }
        Ok(inner.templates.remove(&id).is_some())
    }
}

#[async_trait]
impl TagRepository for InMemoryTemplateStore {
    async fn next_tag_id(&self) -> StoreResult<i32> {
        let mut inner = self.inner.lock();
        inner.tag_seq = inner
            .tag_seq
            .checked_add(1)
            .ok_or(StoreError::SequenceExhausted("query_tag_id_seq"))?;
        Ok(inner.tag_seq)
    }

    async fn insert_tag(&self, tag: &QueryTag) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.templates.contains_key(&tag.template_id) {
            return Err(StoreError::MissingTemplate(tag.template_id));
        }
        inner.tags.insert(tag.id, tag.clone());
        Ok(())
    }

    async fn tags_for_template(&self, template_id: i32) -> StoreResult<Vec<QueryTag>> {
        let mut tags: Vec<QueryTag> = self
            .inner
            .lock()
            .tags
            .values()
            .filter(|tag| tag.template_id == template_id)
            .cloned()
            .collect();
        tags.sort_by(|a, b| (b.creation_date, b.id).cmp(&(a.creation_date, a.id)));
        Ok(tags)
    }

    async fn tag_by_id(&self, id: i32) -> StoreResult<Option<QueryTag>> {
        Ok(self.inner.lock().tags.get(&id).cloned())
    }

    async fn delete_tag(&self, id: i32) -> StoreResult<bool> {
        Ok(self.inner.lock().tags.remove(&id).is_some())
    }

    async fn tag_counts(&self) -> StoreResult<HashMap<i32, i64>> {
        let mut counts = HashMap::new();
        for tag in self.inner.lock().tags.values() {
            *counts.entry(tag.template_id).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn template(id: i32, name: &str, category: Option<&str>) -> QueryTemplate {
        QueryTemplate {
            id,
            name: name.into(),
            description: None,
            category: category.map(Into::into),
            query_sql: "SELECT 1".into(),
            params: json!([]),
            output_format: "json".into(),
            max_results: 10,
            timeout_seconds: 5,
            version: 1,
            creation_date: Utc::now(),
            update_date: None,
            active: true,
            deprecated: false,
            deprecation_date: None,
        }
    }

    #[tokio::test]
    async fn sequences_are_independent() {
        let store = InMemoryTemplateStore::new();
        assert_eq!(store.next_template_id().await.unwrap(), 1);
        assert_eq!(store.next_template_id().await.unwrap(), 2);
        assert_eq!(store.next_tag_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn listing_orders_by_category_then_name_with_nulls_last() {
        let store = InMemoryTemplateStore::new();
        store.insert_template(&template(1, "b", Some("ops"))).await.unwrap();
        store.insert_template(&template(2, "a", None)).await.unwrap();
        store.insert_template(&template(3, "a", Some("ops"))).await.unwrap();
        store.insert_template(&template(4, "z", Some("billing"))).await.unwrap();

        let names: Vec<i32> = store
            .list_templates(false)
            .await
            .unwrap()
            .into_iter()
            .map(|template| template.id)
            .collect();
        assert_eq!(names, vec![4, 3, 1, 2]);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let store = InMemoryTemplateStore::new();
        store.insert_template(&template(1, "daily", None)).await.unwrap();
        let err = store
            .insert_template(&template(2, "daily", None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(name) if name == "daily"));
    }

    #[tokio::test]
    async fn version_guard_blocks_stale_writes() {
        let store = InMemoryTemplateStore::new();
        store.insert_template(&template(1, "daily", None)).await.unwrap();
        let mut next = template(1, "daily", None);
        next.version = 2;
        assert!(store.replace_template(&next, Some(1)).await.unwrap());
        assert!(!store.replace_template(&next, Some(1)).await.unwrap());
        assert!(store.replace_template(&next, None).await.unwrap());
    }
}
