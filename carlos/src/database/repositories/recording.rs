//! Recording repository.

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};

use crate::database::models::RecordingDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::{RecordingId, RecordingRequest, RecordingStatus};
use crate::{Error, Result};

/// Request store used by the scheduler and the HTTP layer.
#[async_trait]
pub trait RecordingRepository: Send + Sync {
    /// Requests in `status`, oldest scheduled first.
    async fn find_by_status(&self, status: RecordingStatus) -> Result<Vec<RecordingRequest>>;
    async fn find_by_id(&self, id: RecordingId) -> Result<RecordingRequest>;
    /// Update an existing request. Fails with `NotFound` if the row is gone and
    /// refuses to move its status backwards.
    async fn save(&self, request: &RecordingRequest) -> Result<()>;
    /// Insert a new request. Fails if the id already exists.
    async fn create(&self, request: &RecordingRequest) -> Result<()>;
    async fn list_all(&self) -> Result<Vec<RecordingRequest>>;
    /// Remove every request. Returns the number of rows deleted.
    async fn delete_all(&self) -> Result<u64>;
    /// Highest id ever stored, used to seed the id generator.
    async fn max_id(&self) -> Result<Option<RecordingId>>;
}

const INSERT_SQL: &str = r#"
    INSERT INTO recordings (
        id, user_name, scheduled_time, frequency, sample_rate, gain, rec_time, wait_time,
        az, el, az_range, az_step, el_range, el_step, estimated_duration_ms,
        status, outcome, outcome_detail, captured_points, created_at, updated_at
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const UPDATE_SQL: &str = r#"
    UPDATE recordings SET
        user_name = ?,
        scheduled_time = ?,
        frequency = ?,
        sample_rate = ?,
        gain = ?,
        rec_time = ?,
        wait_time = ?,
        az = ?,
        el = ?,
        az_range = ?,
        az_step = ?,
        el_range = ?,
        el_step = ?,
        estimated_duration_ms = ?,
        status = ?,
        outcome = ?,
        outcome_detail = ?,
        captured_points = ?,
        updated_at = ?
    WHERE id = ?
"#;

async fn bind_and_execute(
    conn: &mut SqliteConnection,
    sql: &str,
    model: &RecordingDbModel,
) -> Result<()> {
    sqlx::query(sql)
        .bind(model.id)
        .bind(&model.user_name)
        .bind(model.scheduled_time)
        .bind(model.frequency)
        .bind(model.sample_rate)
        .bind(model.gain)
        .bind(model.rec_time)
        .bind(model.wait_time)
        .bind(model.az)
        .bind(model.el)
        .bind(model.az_range)
        .bind(model.az_step)
        .bind(model.el_range)
        .bind(model.el_step)
        .bind(model.estimated_duration_ms)
        .bind(&model.status)
        .bind(&model.outcome)
        .bind(&model.outcome_detail)
        .bind(model.captured_points)
        .bind(model.created_at)
        .bind(model.updated_at)
        .execute(conn)
        .await?;
    Ok(())
}

async fn update_existing(conn: &mut SqliteConnection, model: &RecordingDbModel) -> Result<u64> {
    let result = sqlx::query(UPDATE_SQL)
        .bind(&model.user_name)
        .bind(model.scheduled_time)
        .bind(model.frequency)
        .bind(model.sample_rate)
        .bind(model.gain)
        .bind(model.rec_time)
        .bind(model.wait_time)
        .bind(model.az)
        .bind(model.el)
        .bind(model.az_range)
        .bind(model.az_step)
        .bind(model.el_range)
        .bind(model.el_step)
        .bind(model.estimated_duration_ms)
        .bind(&model.status)
        .bind(&model.outcome)
        .bind(&model.outcome_detail)
        .bind(model.captured_points)
        .bind(model.updated_at)
        .bind(model.id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

fn into_requests(models: Vec<RecordingDbModel>) -> Result<Vec<RecordingRequest>> {
    models.into_iter().map(RecordingRequest::try_from).collect()
}

/// SQLx implementation of RecordingRepository.
pub struct SqlxRecordingRepository {
    pool: SqlitePool,
}

impl SqlxRecordingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordingRepository for SqlxRecordingRepository {
    async fn find_by_status(&self, status: RecordingStatus) -> Result<Vec<RecordingRequest>> {
        let models = sqlx::query_as::<_, RecordingDbModel>(
            "SELECT * FROM recordings WHERE status = ? ORDER BY scheduled_time, id",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        into_requests(models)
    }

    async fn find_by_id(&self, id: RecordingId) -> Result<RecordingRequest> {
        sqlx::query_as::<_, RecordingDbModel>("SELECT * FROM recordings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Recording", id.to_string()))?
            .try_into()
    }

    async fn save(&self, request: &RecordingRequest) -> Result<()> {
        let model = RecordingDbModel::from(request);
        retry_on_sqlite_busy("save_recording", || async {
            let mut tx = self.pool.begin().await?;

            let stored: Option<String> =
                sqlx::query_scalar("SELECT status FROM recordings WHERE id = ?")
                    .bind(model.id)
                    .fetch_optional(&mut *tx)
                    .await?;

            let Some(stored) = stored else {
                return Err(Error::not_found("Recording", model.id.to_string()));
            };
            if let Some(current) = RecordingStatus::parse(&stored)
                && !current.can_transition_to(request.status)
            {
                return Err(Error::InvalidStateTransition {
                    from: current.to_string(),
                    to: request.status.to_string(),
                });
            }

            if update_existing(&mut *tx, &model).await? == 0 {
                return Err(Error::not_found("Recording", model.id.to_string()));
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn create(&self, request: &RecordingRequest) -> Result<()> {
        let model = RecordingDbModel::from(request);
        retry_on_sqlite_busy("create_recording", || async {
            let mut conn = self.pool.acquire().await?;
            bind_and_execute(&mut *conn, INSERT_SQL, &model).await
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<RecordingRequest>> {
        let models = sqlx::query_as::<_, RecordingDbModel>(
            "SELECT * FROM recordings ORDER BY scheduled_time, id",
        )
        .fetch_all(&self.pool)
        .await?;
        into_requests(models)
    }

    async fn delete_all(&self) -> Result<u64> {
        retry_on_sqlite_busy("delete_all_recordings", || async {
            let result = sqlx::query("DELETE FROM recordings")
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn max_id(&self) -> Result<Option<RecordingId>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM recordings")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }
}
