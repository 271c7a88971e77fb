use anyhow::Result;
use sqlx::SqlitePool;

/// Create the vector-store tables. Safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per collection (class); dims fixed at creation.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            dims INTEGER NOT NULL,
            vectorizer TEXT NOT NULL DEFAULT 'none',
            index_type TEXT NOT NULL DEFAULT 'hnsw',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_records (
            id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (collection) REFERENCES collections(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vector_records_collection ON vector_records(collection)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
