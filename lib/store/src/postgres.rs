//! PostgreSQL implementation of [`TimetableStore`].

use crate::error::StoreError;
use crate::model::{Bearer, CredentialRecord, Event, ScheduleEntity};
use crate::store::{EventRange, TimetableStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classync_core::{EventId, ScheduleId, UserId};
use rootcause::prelude::Report;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::str::FromStr;
use tracing::{debug, instrument};

/// Rows per INSERT statement; keeps bind parameters under the protocol limit.
const INSERT_BATCH: usize = 1000;

const SCHEDULE_COLUMNS: &str = "id, user_id, provider_id, organization_id, \
     sync_interval_minutes, last_synced_at, created_at";

/// Row type for schedule queries.
#[derive(FromRow)]
struct ScheduleRow {
    id: String,
    user_id: String,
    provider_id: String,
    organization_id: Option<String>,
    sync_interval_minutes: i32,
    last_synced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ScheduleRow {
    fn try_into_schedule(self) -> Result<ScheduleEntity, StoreError> {
        let id = ScheduleId::from_str(&self.id).map_err(|e| StoreError::Decode {
            reason: format!("invalid schedule id '{}': {e}", self.id),
        })?;
        let user_id = UserId::from_str(&self.user_id).map_err(|e| StoreError::Decode {
            reason: format!("invalid user id '{}': {e}", self.user_id),
        })?;
        let sync_interval_minutes =
            u32::try_from(self.sync_interval_minutes).map_err(|_| StoreError::Decode {
                reason: format!("negative sync interval on schedule {id}"),
            })?;

        Ok(ScheduleEntity {
            id,
            user_id,
            provider_id: self.provider_id,
            organization_id: self.organization_id,
            sync_interval_minutes,
            last_synced_at: self.last_synced_at,
            created_at: self.created_at,
        })
    }
}

/// Row type for credential queries.
#[derive(FromRow)]
struct CredentialRow {
    ciphertext: String,
    iv: String,
}

/// Row type for event queries.
#[derive(FromRow)]
struct EventRow {
    id: String,
    schedule_id: String,
    hash: String,
    subject: String,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    location: Option<String>,
    teacher: Option<String>,
    color: Option<String>,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event, StoreError> {
        let id = EventId::from_str(&self.id).map_err(|e| StoreError::Decode {
            reason: format!("invalid event id '{}': {e}", self.id),
        })?;
        let schedule_id = ScheduleId::from_str(&self.schedule_id).map_err(|e| {
            StoreError::Decode {
                reason: format!("invalid schedule id '{}': {e}", self.schedule_id),
            }
        })?;

        Ok(Event {
            id,
            schedule_id,
            hash: self.hash,
            subject: self.subject,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            location: self.location,
            teacher: self.teacher,
            color: self.color,
        })
    }
}

fn interval_value(minutes: u32) -> Result<i32, StoreError> {
    i32::try_from(minutes).map_err(|_| StoreError::InvalidValue {
        field: "sync_interval_minutes",
        reason: format!("{minutes} does not fit in the interval column"),
    })
}

/// Repository backed by PostgreSQL.
#[derive(Clone)]
pub struct PgTimetableStore {
    pool: PgPool,
}

impl PgTimetableStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a new pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, Report<StoreError>> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                reason: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    /// Applies the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<(), Report<StoreError>> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database {
                reason: format!("migration failed: {e}"),
            })?;
        Ok(())
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_schedules(
        &self,
        query: sqlx::query::QueryAs<'_, Postgres, ScheduleRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<ScheduleEntity>, StoreError> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(ScheduleRow::try_into_schedule).collect()
    }
}

#[async_trait]
impl TimetableStore for PgTimetableStore {
    #[instrument(skip(self, schedule, credential), fields(schedule_id = %schedule.id))]
    async fn create_schedule(
        &self,
        schedule: &ScheduleEntity,
        credential: &CredentialRecord,
    ) -> Result<(), StoreError> {
        let interval = interval_value(schedule.sync_interval_minutes)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO schedules
                (id, user_id, provider_id, organization_id,
                 sync_interval_minutes, last_synced_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(schedule.id.to_string())
        .bind(schedule.user_id.to_string())
        .bind(&schedule.provider_id)
        .bind(&schedule.organization_id)
        .bind(interval)
        .bind(schedule.last_synced_at)
        .bind(schedule.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db)) = &inserted {
            if db.is_unique_violation() {
                return Err(StoreError::AlreadyExists {
                    provider_id: schedule.provider_id.clone(),
                    organization_id: schedule.organization_id.clone(),
                });
            }
        }
        inserted?;

        sqlx::query(
            r#"
            INSERT INTO schedule_credentials (schedule_id, ciphertext, iv, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(credential.schedule_id.to_string())
        .bind(&credential.ciphertext)
        .bind(&credential.iv)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleEntity>, StoreError> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ScheduleRow::try_into_schedule).transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleEntity>, StoreError> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at, id");
        self.fetch_schedules(sqlx::query_as(&sql)).await
    }

    async fn list_schedules_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ScheduleEntity>, StoreError> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE user_id = $1 ORDER BY created_at, id"
        );
        self.fetch_schedules(sqlx::query_as(&sql).bind(user_id.to_string()))
            .await
    }

    async fn find_credential(
        &self,
        id: ScheduleId,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let row: Option<CredentialRow> = sqlx::query_as(
            r#"
            SELECT ciphertext, iv
            FROM schedule_credentials
            WHERE schedule_id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CredentialRecord {
            schedule_id: id,
            ciphertext: r.ciphertext,
            iv: r.iv,
        }))
    }

    async fn replace_credential(&self, credential: &CredentialRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO schedule_credentials (schedule_id, ciphertext, iv, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (schedule_id)
            DO UPDATE SET ciphertext = $2, iv = $3, updated_at = $4
            "#,
        )
        .bind(credential.schedule_id.to_string())
        .bind(&credential.ciphertext)
        .bind(&credential.iv)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(StoreError::NotFound {
                    id: credential.schedule_id,
                })
            }
            other => other.map(|_| ()).map_err(StoreError::from),
        }
    }

    async fn update_interval(&self, id: ScheduleId, minutes: u32) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE schedules SET sync_interval_minutes = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(interval_value(minutes)?)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    async fn mark_synced(&self, id: ScheduleId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE schedules SET last_synced_at = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(schedule_id = %id))]
    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool, StoreError> {
        // Credentials, events and grants go with it through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_events_from(
        &self,
        id: ScheduleId,
        from: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE schedule_id = $1 AND starts_at >= $2")
            .bind(id.to_string())
            .bind(from)
            .execute(&self.pool)
            .await?;

        debug!(schedule_id = %id, deleted = result.rows_affected(), "deleted window events");
        Ok(result.rows_affected())
    }

    async fn insert_events(&self, events: &[Event]) -> Result<u64, StoreError> {
        let Some(first) = events.first() else {
            return Ok(0);
        };

        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for chunk in events.chunks(INSERT_BATCH) {
            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO events \
                 (id, schedule_id, hash, subject, starts_at, ends_at, location, teacher, color) ",
            );
            builder.push_values(chunk, |mut row, event| {
                row.push_bind(event.id.to_string())
                    .push_bind(event.schedule_id.to_string())
                    .push_bind(event.hash.clone())
                    .push_bind(event.subject.clone())
                    .push_bind(event.starts_at)
                    .push_bind(event.ends_at)
                    .push_bind(event.location.clone())
                    .push_bind(event.teacher.clone())
                    .push_bind(event.color.clone());
            });

            let result = builder.build().execute(&mut *tx).await;
            match result {
                Ok(done) => written += done.rows_affected(),
                Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                    return Err(StoreError::NotFound {
                        id: first.schedule_id,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn list_events(
        &self,
        id: ScheduleId,
        range: EventRange,
    ) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, schedule_id, hash, subject, starts_at, ends_at, location, teacher, color
            FROM events
            WHERE schedule_id = $1
              AND ($2::timestamptz IS NULL OR starts_at >= $2)
              AND ($3::timestamptz IS NULL OR starts_at < $3)
            ORDER BY starts_at, id
            "#,
        )
        .bind(id.to_string())
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    #[instrument(skip(self), fields(bearer_kind = bearer.kind()))]
    async fn granted_schedules(
        &self,
        bearer: &Bearer,
    ) -> Result<Vec<ScheduleEntity>, StoreError> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.user_id, s.provider_id, s.organization_id,
                   s.sync_interval_minutes, s.last_synced_at, s.created_at
            FROM access_grants g
            JOIN schedules s ON s.id = g.schedule_id AND s.user_id = g.user_id
            WHERE g.bearer_kind = $1 AND g.bearer_id = $2
            ORDER BY s.created_at, s.id
            "#,
        )
        .bind(bearer.kind())
        .bind(bearer.id())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScheduleRow::try_into_schedule).collect()
    }
}
