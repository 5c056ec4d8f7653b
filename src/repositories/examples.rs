use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::RetrievalExample;

pub(crate) struct UpsertExample<'a> {
    pub(crate) id: &'a str,
    pub(crate) language: Option<&'a str>,
    pub(crate) code: &'a str,
    pub(crate) embedding: Option<&'a [f32]>,
}

/// Inserts new examples and refreshes changed ones. Re-submitting an
/// identical example touches nothing; the return value counts inserts only.
pub(crate) async fn upsert(
    pool: &PgPool,
    theme: &str,
    examples: &[UpsertExample<'_>],
    now: PrimitiveDateTime,
) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut inserted = 0;

    for example in examples {
        let was_insert = sqlx::query_scalar::<_, bool>(
            "INSERT INTO retrieval_examples (theme, id, language, code, embedding, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$6)
             ON CONFLICT (theme, id) DO UPDATE
             SET language = EXCLUDED.language,
                 code = EXCLUDED.code,
                 embedding = EXCLUDED.embedding,
                 updated_at = EXCLUDED.updated_at
             WHERE retrieval_examples.code IS DISTINCT FROM EXCLUDED.code
                OR retrieval_examples.language IS DISTINCT FROM EXCLUDED.language
                OR retrieval_examples.embedding IS DISTINCT FROM EXCLUDED.embedding
             RETURNING (xmax = 0)",
        )
        .bind(theme)
        .bind(example.id)
        .bind(example.language)
        .bind(example.code)
        .bind(example.embedding.map(|values| Json(values.to_vec())))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if was_insert == Some(true) {
            inserted += 1;
        }
    }

    tx.commit().await?;
    Ok(inserted)
}

pub(crate) async fn delete(
    pool: &PgPool,
    theme: &str,
    example_id: Option<&str>,
    language: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM retrieval_examples
         WHERE theme = $1
           AND ($2::text IS NULL OR id = $2)
           AND ($3::text IS NULL OR language = $3)",
    )
    .bind(theme)
    .bind(example_id)
    .bind(language)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub(crate) async fn list_by_theme(
    pool: &PgPool,
    theme: &str,
) -> Result<Vec<RetrievalExample>, sqlx::Error> {
    sqlx::query_as::<_, RetrievalExample>(
        "SELECT theme, id, language, code, embedding, created_at, updated_at
         FROM retrieval_examples
         WHERE theme = $1
         ORDER BY id",
    )
    .bind(theme)
    .fetch_all(pool)
    .await
}
