//! PostgreSQL-backed `Repository`, gated behind the `database`/`postgres`
//! features — same gating and `sqlx::migrate!` pattern as the teacher's
//! `store_postgres.rs`, collapsed from ~20 workflow-specific tables down to one
//! generic document table since this trait's documents are opaque JSON (§6).

use async_trait::async_trait;
use serde_json::Value as Json;
use sqlx::PgPool;

use super::Repository;

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("failed to run journey-engine migrations: {e}"))
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn save_or_update(&self, key: &str, doc: Json) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO journey_documents (key, doc, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE SET doc = EXCLUDED.doc, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(&doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save(&self, key: &str, doc: Json) -> anyhow::Result<()> {
        let result = sqlx::query("INSERT INTO journey_documents (key, doc) VALUES ($1, $2)")
            .bind(key)
            .bind(&doc)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                anyhow::bail!("key already exists: {key}")
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, key: &str, doc: Json) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE journey_documents SET doc = $2, updated_at = now() WHERE key = $1",
        )
        .bind(key)
        .bind(&doc)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("key does not exist: {key}");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM journey_documents WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Json>> {
        let row: Option<(Json,)> = sqlx::query_as("SELECT doc FROM journey_documents WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(doc,)| doc))
    }

    async fn get_all(&self, doc_type: &str) -> anyhow::Result<Vec<Json>> {
        let prefix = format!("{doc_type}:%");
        let rows: Vec<(Json,)> =
            sqlx::query_as("SELECT doc FROM journey_documents WHERE key LIKE $1")
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(doc,)| doc).collect())
    }

    async fn get_locked(&self, key: &str) -> anyhow::Result<Json> {
        let row: (Json,) =
            sqlx::query_as("SELECT doc FROM journey_documents WHERE key = $1 FOR UPDATE")
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    async fn incr_counter(&self, key: &str) -> anyhow::Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO journey_counters (key, value) VALUES ($1, 1)
            ON CONFLICT (key) DO UPDATE SET value = journey_counters.value + 1
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
