// Atomically transfers one pending scan to one worker.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::models::ImageRef;

#[derive(Debug, Clone)]
pub struct ClaimedScan {
    pub id: Uuid,
    pub image: ImageRef,
}

#[derive(Clone)]
pub struct JobClaimer {
    pool: PgPool,
}

impl JobClaimer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claims the oldest pending scan, skipping rows another transaction
    /// already holds locked. Returns `None` if no pending row is free.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedScan>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, registry, image_name, image_tag
            FROM scans
            WHERE status = 'pending'
            ORDER BY created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: Uuid = row.try_get("id")?;
        let registry: String = row.try_get("registry")?;
        let image_name: String = row.try_get("image_name")?;
        let image_tag: String = row.try_get("image_tag")?;

        sqlx::query(
            "UPDATE scans SET status = 'pulling', worker_id = $1, started_at = now(), updated_at = now() WHERE id = $2",
        )
        .bind(worker_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO audit_log (id, scan_id, previous_status, new_status, message, actor)
            VALUES ($1, $2, 'pending', 'pulling', 'claimed by worker', $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(ClaimedScan {
            id,
            image: ImageRef {
                registry,
                image_name,
                image_tag,
            },
        }))
    }
}
