//! Active tenants from the `tenants` table.

use sqlx::Row;
use uuid::Uuid;

use conductor_core::TenantId;
use conductor_engine::{TenantPage, TenantSource, TenantSourceError};

use super::PgBridge;

/// Pages through `tenants` rows with `status = 'active'`, ordered by id so
/// offsets stay stable between pages.
#[derive(Debug, Clone)]
pub struct PostgresTenantSource {
    db: PgBridge,
}

impl PostgresTenantSource {
    pub fn new(db: PgBridge) -> Self {
        Self { db }
    }
}

impl TenantSource for PostgresTenantSource {
    fn page(&self, offset: usize, limit: usize) -> Result<TenantPage, TenantSourceError> {
        // One extra row tells us whether another page follows.
        let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
        let skip = i64::try_from(offset).unwrap_or(i64::MAX);

        let rows = self
            .db
            .run(|pool| async move {
                sqlx::query("SELECT id FROM tenants WHERE status = 'active' ORDER BY id LIMIT $1 OFFSET $2")
                    .bind(fetch)
                    .bind(skip)
                    .fetch_all(pool)
                    .await
            })
            .map_err(|e| TenantSourceError::Unavailable(e.to_string()))?;

        let mut tenants = Vec::with_capacity(rows.len().min(limit));
        for row in rows.iter().take(limit) {
            let id: Uuid = row
                .try_get("id")
                .map_err(|e| TenantSourceError::Unavailable(e.to_string()))?;
            tenants.push(TenantId::from_uuid(id));
        }
        let next_offset = (rows.len() > limit).then_some(offset + limit);
        Ok(TenantPage { tenants, next_offset })
    }
}
