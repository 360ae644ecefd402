//! PostgreSQL stores shared by every proxy instance of a deployment.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Pool, Postgres};

use super::{
    cutoff, AssignmentGetter, DatastoreError, EventMeta, Generation, HealthReport,
    HealthStatusStore, JobState, ReplicationEvent, ReplicationEventQueue, ReplicationJob,
    RepositoryRecord, RepositoryStore,
};
use crate::config::ConfiguredStorages;
use crate::health::HealthySet;

const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

pub struct PostgresStore {
    pool: Pool<Postgres>,
    storages: ConfiguredStorages,
    max_attempts: u32,
}

impl PostgresStore {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        storages: ConfiguredStorages,
        max_attempts: u32,
    ) -> Result<Self, DatastoreError> {
        let opts = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;
        tracing::info!(max_connections, "connected to postgres");
        Ok(Self {
            pool,
            storages,
            max_attempts,
        })
    }

    /// Create missing tables and indexes.
    pub async fn migrate(&self) -> Result<(), DatastoreError> {
        // Prepared statements only take one statement at a time.
        for statement in schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    fn configured(&self, virtual_storage: &str) -> BTreeSet<String> {
        self.storages
            .get(virtual_storage)
            .map(|storages| storages.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn records(
        &self,
        virtual_storage: &str,
        relative_path: Option<&str>,
    ) -> Result<Vec<RepositoryRecord>, DatastoreError> {
        let rows: Vec<(String, i64, Option<String>)> = sqlx::query_as(
            r#"SELECT relative_path, generation, "primary"
               FROM repositories
               WHERE virtual_storage = $1 AND ($2::text IS NULL OR relative_path = $2)
               ORDER BY relative_path"#,
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let replicas: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT relative_path, storage, generation
             FROM storage_repositories
             WHERE virtual_storage = $1 AND ($2::text IS NULL OR relative_path = $2)",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&self.pool)
        .await?;

        let assignments: Vec<(String, String)> = sqlx::query_as(
            "SELECT relative_path, storage
             FROM repository_assignments
             WHERE virtual_storage = $1 AND ($2::text IS NULL OR relative_path = $2)",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&self.pool)
        .await?;

        let mut records: BTreeMap<String, RepositoryRecord> = rows
            .into_iter()
            .map(|(path, generation, primary)| {
                let record = RepositoryRecord {
                    virtual_storage: virtual_storage.to_string(),
                    relative_path: path.clone(),
                    generation,
                    primary,
                    replicas: BTreeMap::new(),
                    assigned: BTreeSet::new(),
                };
                (path, record)
            })
            .collect();
        for (path, storage, generation) in replicas {
            if let Some(record) = records.get_mut(&path) {
                record.replicas.insert(storage, generation);
            }
        }
        for (path, storage) in assignments {
            if let Some(record) = records.get_mut(&path) {
                record.assigned.insert(storage);
            }
        }
        Ok(records.into_values().collect())
    }
}

#[async_trait]
impl AssignmentGetter for PostgresStore {
    async fn host_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<BTreeSet<String>, DatastoreError> {
        let configured = self.configured(virtual_storage);
        let assigned: Vec<String> = sqlx::query_scalar(
            "SELECT storage FROM repository_assignments
             WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&self.pool)
        .await?;

        let assigned: BTreeSet<String> = assigned
            .into_iter()
            .filter(|storage| configured.contains(storage))
            .collect();
        if assigned.is_empty() {
            return Ok(configured);
        }
        Ok(assigned)
    }
}

#[async_trait]
impl RepositoryStore for PostgresStore {
    async fn generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<Option<Generation>, DatastoreError> {
        let generation = sqlx::query_scalar(
            "SELECT generation FROM storage_repositories
             WHERE virtual_storage = $1 AND relative_path = $2 AND storage = $3",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(storage)
        .fetch_optional(&self.pool)
        .await?;
        Ok(generation)
    }

    async fn is_latest(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<bool, DatastoreError> {
        let row: Option<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT r.generation, s.generation
             FROM repositories r
             LEFT JOIN storage_repositories s
               ON s.virtual_storage = r.virtual_storage
              AND s.relative_path = r.relative_path
              AND s.storage = $3
             WHERE r.virtual_storage = $1 AND r.relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(storage)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            None => true,
            Some((latest, replica)) => replica == Some(latest),
        })
    }

    async fn consistent_secondaries(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
    ) -> Result<BTreeSet<String>, DatastoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM repositories WHERE virtual_storage = $1 AND relative_path = $2
             )",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_one(&self.pool)
        .await?;
        if !exists {
            let mut assigned = self.host_assignments(virtual_storage, relative_path).await?;
            assigned.remove(primary);
            return Ok(assigned);
        }

        let storages: Vec<String> = sqlx::query_scalar(
            "SELECT s.storage
             FROM storage_repositories s
             JOIN storage_repositories p
               ON p.virtual_storage = s.virtual_storage
              AND p.relative_path = s.relative_path
              AND p.storage = $3
             WHERE s.virtual_storage = $1
               AND s.relative_path = $2
               AND s.storage <> $3
               AND s.generation = p.generation",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(primary)
        .fetch_all(&self.pool)
        .await?;
        Ok(storages.into_iter().collect())
    }

    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        secondaries: &[String],
    ) -> Result<Generation, DatastoreError> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query(
            r#"INSERT INTO repositories (virtual_storage, relative_path, generation, "primary")
               VALUES ($1, $2, 0, $3)
               ON CONFLICT (virtual_storage, relative_path) DO NOTHING"#,
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(primary)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let generation: Generation = if created {
            0
        } else {
            sqlx::query_scalar(
                "UPDATE repositories r
                 SET generation = r.generation + 1
                 FROM storage_repositories s
                 WHERE r.virtual_storage = $1
                   AND r.relative_path = $2
                   AND s.virtual_storage = r.virtual_storage
                   AND s.relative_path = r.relative_path
                   AND s.storage = $3
                   AND s.generation = r.generation
                 RETURNING r.generation",
            )
            .bind(virtual_storage)
            .bind(relative_path)
            .bind(primary)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DatastoreError::WriteToOutdatedNodes {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
                primary: primary.to_string(),
            })?
        };

        let mut storages = Vec::with_capacity(secondaries.len() + 1);
        storages.push(primary.to_string());
        storages.extend(secondaries.iter().cloned());
        sqlx::query(
            "INSERT INTO storage_repositories (virtual_storage, relative_path, storage, generation)
             SELECT $1, $2, storage, $4 FROM unnest($3::text[]) AS storage
             ON CONFLICT (virtual_storage, relative_path, storage)
             DO UPDATE SET generation = EXCLUDED.generation",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(storages)
        .bind(generation)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(generation)
    }

    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: Generation,
    ) -> Result<(), DatastoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO repositories (virtual_storage, relative_path, generation)
             VALUES ($1, $2, $3)
             ON CONFLICT (virtual_storage, relative_path)
             DO UPDATE SET generation = GREATEST(repositories.generation, EXCLUDED.generation)",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(generation)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO storage_repositories (virtual_storage, relative_path, storage, generation)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (virtual_storage, relative_path, storage)
             DO UPDATE SET generation = EXCLUDED.generation",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(storage)
        .bind(generation)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<(), DatastoreError> {
        sqlx::query("DELETE FROM repositories WHERE virtual_storage = $1 AND relative_path = $2")
            .bind(virtual_storage)
            .bind(relative_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), DatastoreError> {
        sqlx::query(
            "DELETE FROM storage_repositories
             WHERE virtual_storage = $1 AND relative_path = $2 AND storage = $3",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(storage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rename_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        new_relative_path: &str,
    ) -> Result<(), DatastoreError> {
        let mut tx = self.pool.begin().await?;
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM repositories WHERE virtual_storage = $1 AND relative_path = $2
             )",
        )
        .bind(virtual_storage)
        .bind(new_relative_path)
        .fetch_one(&mut *tx)
        .await?;
        if taken {
            return Err(DatastoreError::RepositoryExists {
                virtual_storage: virtual_storage.to_string(),
                relative_path: new_relative_path.to_string(),
            });
        }

        // Replicas and assignments follow through ON UPDATE CASCADE.
        let renamed = sqlx::query(
            "UPDATE repositories SET relative_path = $3
             WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(new_relative_path)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if renamed == 0 {
            return Err(DatastoreError::RepositoryNotFound {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
            });
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storages: &[String],
    ) -> Result<(), DatastoreError> {
        let configured = self.configured(virtual_storage);
        if let Some(unknown) = storages.iter().find(|s| !configured.contains(*s)) {
            return Err(DatastoreError::InvalidAssignment(format!(
                "storage {unknown:?} is not configured in {virtual_storage}"
            )));
        }

        let mut tx = self.pool.begin().await?;
        let primary: Option<Option<String>> = sqlx::query_scalar(
            r#"SELECT "primary" FROM repositories
               WHERE virtual_storage = $1 AND relative_path = $2
               FOR UPDATE"#,
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(primary) = primary else {
            return Err(DatastoreError::RepositoryNotFound {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
            });
        };
        if let Some(primary) = primary {
            if !storages.contains(&primary) {
                return Err(DatastoreError::InvalidAssignment(format!(
                    "primary {primary:?} must stay assigned"
                )));
            }
        }

        sqlx::query(
            "DELETE FROM repository_assignments WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO repository_assignments (virtual_storage, relative_path, storage)
             SELECT $1, $2, storage FROM unnest($3::text[]) AS storage",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(storages.to_vec())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        expected: Option<&str>,
        primary: Option<&str>,
    ) -> Result<bool, DatastoreError> {
        let updated = sqlx::query(
            r#"UPDATE repositories SET "primary" = $4
               WHERE virtual_storage = $1
                 AND relative_path = $2
                 AND "primary" IS NOT DISTINCT FROM $3"#,
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(expected)
        .bind(primary)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Option<RepositoryRecord>, DatastoreError> {
        Ok(self
            .records(virtual_storage, Some(relative_path))
            .await?
            .into_iter()
            .next())
    }

    async fn repositories(
        &self,
        virtual_storage: &str,
    ) -> Result<Vec<RepositoryRecord>, DatastoreError> {
        self.records(virtual_storage, None).await
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    state: String,
    attempt: i32,
    lock_id: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    job: Json<ReplicationJob>,
    meta: Json<EventMeta>,
}

impl TryFrom<EventRow> for ReplicationEvent {
    type Error = DatastoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(ReplicationEvent {
            id: u64::try_from(row.id).unwrap_or_default(),
            state: row.state.parse()?,
            attempt: u32::try_from(row.attempt).unwrap_or_default(),
            lock_id: row.lock_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            job: row.job.0,
            meta: row.meta.0,
        })
    }
}

fn events(rows: Vec<EventRow>) -> Result<Vec<ReplicationEvent>, DatastoreError> {
    let mut events = rows
        .into_iter()
        .map(ReplicationEvent::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    events.sort_by_key(|event| event.id);
    Ok(events)
}

fn ids(ids: &[u64]) -> Vec<i64> {
    ids.iter().filter_map(|id| i64::try_from(*id).ok()).collect()
}

fn sorted_ids(ids: Vec<i64>) -> Vec<u64> {
    let mut ids: Vec<u64> = ids.into_iter().filter_map(|id| u64::try_from(id).ok()).collect();
    ids.sort_unstable();
    ids
}

#[async_trait]
impl ReplicationEventQueue for PostgresStore {
    async fn enqueue(
        &self,
        job: ReplicationJob,
        meta: EventMeta,
    ) -> Result<ReplicationEvent, DatastoreError> {
        let row: EventRow = sqlx::query_as(
            "WITH lock AS (
                 INSERT INTO replication_queue_lock (id) VALUES ($1)
                 ON CONFLICT (id) DO NOTHING
             )
             INSERT INTO replication_queue (lock_id, job, meta)
             VALUES ($1, $2, $3)
             RETURNING id, state, attempt, lock_id, created_at, updated_at, job, meta",
        )
        .bind(job.lock_id())
        .bind(Json(&job))
        .bind(Json(&meta))
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn dequeue(
        &self,
        virtual_storage: &str,
        target_storage: &str,
        count: usize,
    ) -> Result<Vec<ReplicationEvent>, DatastoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "WITH candidate AS (
                 SELECT DISTINCT ON (q.lock_id) q.id, q.lock_id
                 FROM replication_queue q
                 WHERE q.job->>'virtual_storage' = $1
                   AND q.job->>'target_node_storage' = $2
                   AND q.state IN ('ready', 'failed')
                 ORDER BY q.lock_id, q.id
             ), eligible AS (
                 SELECT c.id, c.lock_id
                 FROM candidate c
                 JOIN replication_queue_lock l ON l.id = c.lock_id
                 WHERE NOT l.acquired
                 ORDER BY c.id
                 LIMIT $3
                 FOR UPDATE OF l SKIP LOCKED
             ), acquire AS (
                 UPDATE replication_queue_lock l
                 SET acquired = TRUE
                 FROM eligible e
                 WHERE l.id = e.lock_id
             )
             UPDATE replication_queue q
             SET state = 'in_progress', attempt = q.attempt + 1, updated_at = NOW()
             FROM eligible e
             WHERE q.id = e.id
             RETURNING q.id, q.state, q.attempt, q.lock_id, q.created_at, q.updated_at, q.job, q.meta",
        )
        .bind(virtual_storage)
        .bind(target_storage)
        .bind(i64::try_from(count).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        events(rows)
    }

    async fn acknowledge(&self, state: JobState, ids_to_ack: &[u64]) -> Result<Vec<u64>, DatastoreError> {
        if !state.is_acknowledgeable() {
            return Err(DatastoreError::InvalidAcknowledgeState(state));
        }
        let acknowledged: Vec<i64> = sqlx::query_scalar(
            "WITH acked AS (
                 UPDATE replication_queue q
                 SET state = CASE
                         WHEN $1::text = 'failed' AND q.attempt >= $3 THEN 'dead'
                         ELSE $1::text
                     END,
                     updated_at = NOW()
                 WHERE q.id = ANY($2) AND q.state = 'in_progress'
                 RETURNING q.id, q.lock_id
             ), released AS (
                 UPDATE replication_queue_lock l
                 SET acquired = FALSE
                 FROM acked a
                 WHERE l.id = a.lock_id
             )
             SELECT id FROM acked",
        )
        .bind(state.as_str())
        .bind(ids(ids_to_ack))
        .bind(i32::try_from(self.max_attempts).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(sorted_ids(acknowledged))
    }

    async fn acknowledge_stale(&self, stale_after: Duration) -> Result<u64, DatastoreError> {
        let released: i64 = sqlx::query_scalar(
            "WITH stale AS (
                 UPDATE replication_queue q
                 SET state = CASE WHEN q.attempt >= $2 THEN 'dead' ELSE 'failed' END,
                     updated_at = NOW()
                 WHERE q.state = 'in_progress'
                   AND COALESCE(q.updated_at, q.created_at) < $1
                 RETURNING q.lock_id
             ), released AS (
                 UPDATE replication_queue_lock l
                 SET acquired = FALSE
                 FROM stale s
                 WHERE l.id = s.lock_id
             )
             SELECT COUNT(*) FROM stale",
        )
        .bind(cutoff(Utc::now(), stale_after))
        .bind(i32::try_from(self.max_attempts).unwrap_or(i32::MAX))
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(released).unwrap_or_default())
    }

    async fn cancel_pending(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<u64>, DatastoreError> {
        let cancelled: Vec<i64> = sqlx::query_scalar(
            "UPDATE replication_queue
             SET state = 'cancelled', updated_at = NOW()
             WHERE job->>'virtual_storage' = $1
               AND job->>'relative_path' = $2
               AND state IN ('ready', 'failed')
             RETURNING id",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .fetch_all(&self.pool)
        .await?;
        Ok(sorted_ids(cancelled))
    }

    async fn has_pending_update(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        target_storage: &str,
    ) -> Result<bool, DatastoreError> {
        let pending = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM replication_queue
                 WHERE job->>'change' = 'update'
                   AND job->>'virtual_storage' = $1
                   AND job->>'relative_path' = $2
                   AND job->>'target_node_storage' = $3
                   AND state IN ('ready', 'in_progress', 'failed')
             )",
        )
        .bind(virtual_storage)
        .bind(relative_path)
        .bind(target_storage)
        .fetch_one(&self.pool)
        .await?;
        Ok(pending)
    }
}

#[async_trait]
impl HealthStatusStore for PostgresStore {
    async fn report_health(
        &self,
        instance: &str,
        reports: &[HealthReport],
        now: DateTime<Utc>,
        participant_timeout: Duration,
        healthiness_timeout: Duration,
    ) -> Result<HealthySet, DatastoreError> {
        let virtual_storages: Vec<String> =
            reports.iter().map(|r| r.virtual_storage.clone()).collect();
        let storages: Vec<String> = reports.iter().map(|r| r.storage.clone()).collect();
        let healthy: Vec<bool> = reports.iter().map(|r| r.healthy).collect();

        // Rows written by this statement are only visible through RETURNING,
        // so this instance's rows come from `reported` and the rest from the
        // table.
        let rows: Vec<(String, String)> = sqlx::query_as(
            "WITH reported AS (
                 INSERT INTO node_status
                     (instance_name, virtual_storage, storage, last_contact_attempt_at, last_seen_active_at)
                 SELECT $1, r.virtual_storage, r.storage, $5, CASE WHEN r.healthy THEN $5 END
                 FROM unnest($2::text[], $3::text[], $4::bool[]) AS r(virtual_storage, storage, healthy)
                 ON CONFLICT (instance_name, virtual_storage, storage) DO UPDATE SET
                     last_contact_attempt_at = EXCLUDED.last_contact_attempt_at,
                     last_seen_active_at = COALESCE(EXCLUDED.last_seen_active_at, node_status.last_seen_active_at)
                 RETURNING instance_name, virtual_storage, storage, last_contact_attempt_at, last_seen_active_at
             ), statuses AS (
                 SELECT * FROM reported
                 UNION ALL
                 SELECT instance_name, virtual_storage, storage, last_contact_attempt_at, last_seen_active_at
                 FROM node_status
                 WHERE instance_name <> $1
             ), participants AS (
                 SELECT COUNT(DISTINCT instance_name) AS total
                 FROM statuses
                 WHERE last_contact_attempt_at >= $6
             )
             SELECT s.virtual_storage, s.storage
             FROM statuses s
             JOIN unnest($2::text[], $3::text[]) AS r(virtual_storage, storage)
               ON r.virtual_storage = s.virtual_storage AND r.storage = s.storage
             WHERE s.last_contact_attempt_at >= $6
               AND s.last_seen_active_at >= $7
             GROUP BY s.virtual_storage, s.storage
             HAVING COUNT(*) >= (SELECT total FROM participants) / 2 + 1",
        )
        .bind(instance)
        .bind(virtual_storages)
        .bind(storages)
        .bind(healthy)
        .bind(now)
        .bind(cutoff(now, participant_timeout))
        .bind(cutoff(now, healthiness_timeout))
        .fetch_all(&self.pool)
        .await?;

        let mut set = HealthySet::default();
        for (virtual_storage, storage) in rows {
            set.insert(&virtual_storage, &storage);
        }
        Ok(set)
    }
}
