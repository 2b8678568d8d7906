use super::repository::{StoreError, StoreResult, TagRepository, TemplateRepository};
use crate::{
    db::{PgConnectionManager, PgPool},
    models::{QueryTag, QueryTemplate},
    schema::{query_tags, query_templates},
};
use async_trait::async_trait;
use bb8::PooledConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::BigInt;
use diesel_async::RunQueryDsl;
use std::collections::HashMap;
use tracing::error;

const TEMPLATE_SEQUENCE: &str = "query_template_id_seq";
const TAG_SEQUENCE: &str = "query_tag_id_seq";

#[derive(QueryableByName)]
struct NextId {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

/// Template and tag store over the metadata database.
#[derive(Clone)]
pub struct PgTemplateStore {
    pool: PgPool,
}

impl PgTemplateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> StoreResult<PooledConnection<'_, PgConnectionManager>> {
        self.pool.get().await.map_err(|err| {
            error!(error = ?err, "failed to acquire template store connection");
            StoreError::Pool(format!("{err:?}"))
        })
    }

    async fn next_value(&self, sequence: &'static str) -> StoreResult<i32> {
        let mut conn = self.conn().await?;
        let next: NextId = diesel::sql_query(format!("SELECT nextval('{sequence}') AS id"))
            .get_result(&mut *conn)
            .await?;
        i32::try_from(next.id).map_err(|_| StoreError::SequenceExhausted(sequence))
    }
}

fn classify(
    err: DieselError,
    on_unique: impl FnOnce() -> StoreError,
    on_foreign_key: impl FnOnce() -> StoreError,
) -> StoreError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => on_unique(),
        DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => on_foreign_key(),
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl TemplateRepository for PgTemplateStore {
    async fn next_template_id(&self) -> StoreResult<i32> {
        self.next_value(TEMPLATE_SEQUENCE).await
    }

    async fn template_by_name(&self, name: &str) -> StoreResult<Option<QueryTemplate>> {
        use query_templates::dsl;

        let mut conn = self.conn().await?;
        let template = dsl::query_templates
            .filter(dsl::name.eq(name))
            .filter(dsl::active.eq(true))
            .filter(dsl::deprecated.eq(false))
            .select(QueryTemplate::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        Ok(template)
    }

    async fn template_by_id(&self, id: i32) -> StoreResult<Option<QueryTemplate>> {
        use query_templates::dsl;

        let mut conn = self.conn().await?;
        let template = dsl::query_templates
            .filter(dsl::id_query_template.eq(id))
            .select(QueryTemplate::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        Ok(template)
    }

    async fn list_templates(&self, active_only: bool) -> StoreResult<Vec<QueryTemplate>> {
        use query_templates::dsl;

        let mut conn = self.conn().await?;
        let mut query = dsl::query_templates
            .select(QueryTemplate::as_select())
            .order((dsl::category.asc(), dsl::name.asc()))
            .into_boxed();
        if active_only {
            query = query
                .filter(dsl::active.eq(true))
                .filter(dsl::deprecated.eq(false));
        }
        Ok(query.load(&mut *conn).await?)
    }

    async fn insert_template(&self, template: &QueryTemplate) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(query_templates::table)
            .values(template)
            .execute(&mut *conn)
            .await
            .map_err(|err| {
                classify(
                    err,
                    || StoreError::DuplicateName(template.name.clone()),
                    || StoreError::MissingTemplate(template.id),
                )
            })?;
        Ok(())
    }

    async fn replace_template(
        &self,
        template: &QueryTemplate,
        expected_version: Option<i32>,
    ) -> StoreResult<bool> {
        use query_templates::dsl;

        let mut conn = self.conn().await?;
        let target = dsl::query_templates.filter(dsl::id_query_template.eq(template.id));
        let written = match expected_version {
            Some(version) => {
                diesel::update(target.filter(dsl::version.eq(version)))
                    .set(template)
                    .execute(&mut *conn)
                    .await
            }
            None => diesel::update(target).set(template).execute(&mut *conn).await,
        }
        .map_err(|err| {
            classify(
                err,
                || StoreError::DuplicateName(template.name.clone()),
                || StoreError::MissingTemplate(template.id),
            )
        })?;
        Ok(written > 0)
    }

    async fn delete_template(&self, id: i32) -> StoreResult<bool> {
        use query_templates::dsl;

        let mut conn = self.conn().await?;
        let deleted = diesel::delete(dsl::query_templates.filter(dsl::id_query_template.eq(id)))
            .execute(&mut *conn)
            .await
            .map_err(|err| {
                classify(
                    err,
                    || StoreError::StillReferenced(id),
                    || StoreError::StillReferenced(id),
                )
            })?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl TagRepository for PgTemplateStore {
    async fn next_tag_id(&self) -> StoreResult<i32> {
        self.next_value(TAG_SEQUENCE).await
    }

    async fn insert_tag(&self, tag: &QueryTag) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(query_tags::table)
            .values(tag)
            .execute(&mut *conn)
            .await
            .map_err(|err| match err {
                DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
                    StoreError::MissingTemplate(tag.template_id)
                }
                other => StoreError::Database(other),
            })?;
        Ok(())
    }

    async fn tags_for_template(&self, template_id: i32) -> StoreResult<Vec<QueryTag>> {
        use query_tags::dsl;

        let mut conn = self.conn().await?;
        let tags = dsl::query_tags
            .filter(dsl::id_query_template.eq(template_id))
            .select(QueryTag::as_select())
            .order((dsl::creation_date.desc(), dsl::id_query_query_tag.desc()))
            .load(&mut *conn)
            .await?;
        Ok(tags)
    }

    async fn tag_by_id(&self, id: i32) -> StoreResult<Option<QueryTag>> {
        use query_tags::dsl;

        let mut conn = self.conn().await?;
        let tag = dsl::query_tags
            .filter(dsl::id_query_query_tag.eq(id))
            .select(QueryTag::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        Ok(tag)
    }

    async fn delete_tag(&self, id: i32) -> StoreResult<bool> {
        use query_tags::dsl;

        let mut conn = self.conn().await?;
        let deleted = diesel::delete(dsl::query_tags.filter(dsl::id_query_query_tag.eq(id)))
            .execute(&mut *conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn tag_counts(&self) -> StoreResult<HashMap<i32, i64>> {
        use query_tags::dsl;

        let mut conn = self.conn().await?;
        let counts: Vec<(i32, i64)> = dsl::query_tags
            .group_by(dsl::id_query_template)
            .select((dsl::id_query_template, diesel::dsl::count_star()))
            .load(&mut *conn)
            .await?;
        Ok(counts.into_iter().collect())
    }
}
