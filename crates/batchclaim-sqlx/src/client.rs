//! Collection setup and document insertion.
use serde::Serialize;
use sqlx::{Postgres, QueryBuilder, types::Json};

use crate::{Error, ErrorKind, NotAnObjectError, field_expr, quote_ident};

/// A handle for creating a collection and filling it with documents.
#[derive(Debug, Clone)]
pub struct Client {
    pool: sqlx::PgPool,
    collection: std::borrow::Cow<'static, str>,
}

impl Client {
    /// Create a new client bound to the given connection pool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            collection: crate::DEFAULT_COLLECTION_NAME.into(),
        }
    }

    /// Specify the collection (table) name.
    pub fn collection<S>(self, collection: S) -> Self
    where
        S: Into<std::borrow::Cow<'static, str>>,
    {
        Self {
            collection: collection.into(),
            ..self
        }
    }

    /// Create the collection table if it does not exist yet.
    pub async fn create_collection(&self) -> Result<(), Error> {
        let sql = create_table_sql(&self.collection);
        sqlx::query(&sql).execute(&self.pool).await?;
        tracing::debug!(collection = %self.collection, "Collection ready");
        Ok(())
    }

    /// Index one document field, e.g. the state field claims filter on.
    ///
    /// The index is on `body -> 'field'`, the same expression
    /// [`PgDocumentStore`](crate::PgDocumentStore) renders for filters, ordering
    /// and the id lookup of conditional updates.
    pub async fn create_index(&self, field: &str) -> Result<(), Error> {
        let sql = create_index_sql(&self.collection, field);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a document using the client's connection pool.
    pub async fn insert<T>(&self, document: &T) -> Result<(), Error>
    where
        T: Serialize + Sync,
    {
        let mut conn = self.pool.acquire().await?;
        self.insert_tx(document, &mut *conn).await?;

        Ok(())
    }

    /// Insert a document using an existing transaction or connection.
    #[allow(clippy::manual_async_fn)]
    pub fn insert_tx<'a, 'c, 'data, T, A>(
        &self,
        document: &'data T,
        tx: A,
    ) -> impl Future<Output = Result<(), Error>> + Send
    where
        T: Serialize + Sync,
        A: sqlx::Acquire<'c, Database = Postgres> + Send + 'a,
    {
        async move {
            let value = serde_json::to_value(document)?;
            if !value.is_object() {
                return Err(Error {
                    kind: ErrorKind::Encode,
                    inner: Box::new(NotAnObjectError),
                });
            }

            let mut conn = tx.acquire().await?;
            let mut query = insert_query(&self.collection, value);
            query.build().execute(&mut *conn).await?;
            Ok(())
        }
    }
}

fn create_table_sql(collection: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (seq BIGSERIAL PRIMARY KEY, body JSONB NOT NULL)",
        quote_ident(collection)
    )
}

pub(crate) fn create_index_sql(collection: &str, field: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (({}))",
        quote_ident(&format!("{collection}_{field}_idx")),
        quote_ident(collection),
        field_expr(field)
    )
}

fn insert_query(collection: &str, document: serde_json::Value) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("INSERT INTO ");
    builder
        .push(quote_ident(collection))
        .push(" (body) VALUES (")
        .push_bind(Json(document))
        .push(")");
    builder
}
