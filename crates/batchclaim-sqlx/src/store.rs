//! [`DocumentStore`] over a PostgreSQL table.
use batchclaim_core::{
    Comparison, ConditionalUpdate, Direction, Document, DocumentId, DocumentStore, Filter, SortKey,
};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder, types::Json};

use crate::{field_expr, quote_ident};

/// Store for one collection, backed by the table of the same name.
///
/// The table is expected to look like the one [`Client::create_collection`]
/// creates: a `seq` column giving insertion order and a `body jsonb` column.
///
/// [`Client::create_collection`]: crate::Client::create_collection
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: sqlx::PgPool,
    collection: std::borrow::Cow<'static, str>,
}

impl PgDocumentStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            collection: std::borrow::Cow::Borrowed(crate::DEFAULT_COLLECTION_NAME),
        }
    }

    /// Use another collection, typically `Configuration::collection_name`.
    pub fn collection<S>(self, collection: S) -> Self
    where
        S: Into<std::borrow::Cow<'static, str>>,
    {
        Self {
            collection: collection.into(),
            ..self
        }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

impl DocumentStore for PgDocumentStore {
    type Error = crate::Error;

    async fn find(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        limit: Option<usize>,
    ) -> Result<Vec<Document>, Self::Error> {
        let mut query = find_query(&self.collection, filter, sort, limit);
        let documents = query
            .build_query_scalar::<Json<Document>>()
            .fetch_all(&self.pool)
            .await?;
        Ok(documents.into_iter().map(|Json(document)| document).collect())
    }

    async fn conditional_update(
        &self,
        update: &ConditionalUpdate,
    ) -> Result<Vec<DocumentId>, Self::Error> {
        if update.ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = update_query(&self.collection, update);
        let ids = query
            .build_query_scalar::<Option<Json<Value>>>()
            .fetch_all(&self.pool)
            .await?;
        tracing::trace!(
            collection = %self.collection,
            requested = update.ids.len(),
            matched = ids.len(),
            "Conditional update"
        );
        Ok(ids
            .into_iter()
            .flatten()
            .filter_map(|Json(id)| DocumentId::from_value(&id))
            .collect())
    }
}

fn find_query(
    collection: &str,
    filter: &Filter,
    sort: &[SortKey],
    limit: Option<usize>,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("SELECT body FROM ");
    builder.push(quote_ident(collection));
    push_conditions(&mut builder, filter, " WHERE ");

    builder.push(" ORDER BY ");
    for key in sort {
        builder.push(field_expr(&key.field));
        // Missing fields sort first when ascending and last when descending,
        // as in `SortKey::compare`. Between present values jsonb's own order
        // applies (null < string < number < boolean), which differs from
        // `SortKey::compare` when one field mixes types.
        builder.push(match key.direction {
            Direction::Ascending => " ASC NULLS FIRST, ",
            Direction::Descending => " DESC NULLS LAST, ",
        });
    }
    builder.push("seq");

    if let Some(limit) = limit {
        builder
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    builder
}

fn update_query(collection: &str, update: &ConditionalUpdate) -> QueryBuilder<'static, Postgres> {
    let ids = update
        .ids
        .iter()
        .map(|id| Json(id.to_value()))
        .collect::<Vec<_>>();

    let mut builder = QueryBuilder::new("UPDATE ");
    builder
        .push(quote_ident(collection))
        .push(" SET body = body || ")
        .push_bind(Json(update.set.clone()))
        .push(" WHERE ")
        .push(field_expr(&update.id_field))
        .push(" = ANY(")
        .push_bind(ids)
        .push(")");
    push_conditions(&mut builder, &update.guard, " AND ");
    builder
        .push(" RETURNING ")
        .push(field_expr(&update.id_field));
    builder
}

/// Append `filter` as a conjunction, starting with `separator`.
fn push_conditions(
    builder: &mut QueryBuilder<'static, Postgres>,
    filter: &Filter,
    mut separator: &'static str,
) {
    for condition in filter.conditions() {
        builder.push(separator);
        separator = " AND ";

        let field = field_expr(&condition.field);
        let value = Json(condition.value.clone());
        match condition.op {
            Comparison::Eq => {
                builder.push(field).push(" = ").push_bind(value);
            }
            // jsonb orders across types; only compare like with like.
            Comparison::Lt => {
                builder
                    .push("(jsonb_typeof(")
                    .push(&field)
                    .push(") = jsonb_typeof(")
                    .push_bind(value.clone())
                    .push(") AND ")
                    .push(field)
                    .push(" < ")
                    .push_bind(value);
                builder.push(")");
            }
        }
    }
}
