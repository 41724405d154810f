//! Postgres-backed instance store.
//!
//! One row per instance id holding the indexed columns plus the full instance
//! as JSONB, and a side table with the correlation key the instance currently
//! waits under.

use crate::models::{InstanceId, OrchestrationInstance};
use crate::state_machine::errors::{PersistenceError, PersistenceResult};
use crate::state_machine::persistence::{CreateOutcome, InstanceStore};
use crate::state_machine::CommandState;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

const INSERT_INSTANCE: &str = r#"
    INSERT INTO ota_command_instances
        (instance_id, command_id, mobile_id, state, stage_started_at, stage_deadline,
         created_at, last_updated_at, completion_emitted, instance)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (instance_id) DO NOTHING
"#;

const REPLACE_INSTANCE: &str = r#"
    UPDATE ota_command_instances
    SET command_id = $2, mobile_id = $3, state = $4, stage_started_at = $5,
        stage_deadline = $6, created_at = $7, last_updated_at = $8,
        completion_emitted = $9, instance = $10
    WHERE instance_id = $1
"#;

const UPSERT_INSTANCE: &str = r#"
    INSERT INTO ota_command_instances
        (instance_id, command_id, mobile_id, state, stage_started_at, stage_deadline,
         created_at, last_updated_at, completion_emitted, instance)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (instance_id) DO UPDATE
    SET state = EXCLUDED.state,
        stage_started_at = EXCLUDED.stage_started_at,
        stage_deadline = EXCLUDED.stage_deadline,
        last_updated_at = EXCLUDED.last_updated_at,
        completion_emitted = EXCLUDED.completion_emitted,
        instance = EXCLUDED.instance
    WHERE ota_command_instances.command_id = EXCLUDED.command_id
      AND (ota_command_instances.state NOT IN ('completed', 'failed', 'timed_out')
           OR ota_command_instances.state = EXCLUDED.state)
"#;

#[derive(Debug, Clone)]
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write_instance(
        tx: &mut Transaction<'_, Postgres>,
        sql: &str,
        instance: &OrchestrationInstance,
    ) -> PersistenceResult<u64> {
        let document = serde_json::to_value(instance)?;
        let result = sqlx::query(sql)
            .bind(instance.instance_id.as_str())
            .bind(instance.command_request.command_id)
            .bind(instance.mobile_id())
            .bind(instance.state.as_str())
            .bind(instance.stage_started_at)
            .bind(instance.stage_deadline)
            .bind(instance.created_at)
            .bind(instance.last_updated_at)
            .bind(instance.completion_emitted)
            .bind(document)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Keep the correlation-key row in step with the instance state
    async fn write_correlation_key(
        tx: &mut Transaction<'_, Postgres>,
        instance: &OrchestrationInstance,
    ) -> PersistenceResult<()> {
        match instance.correlation_key() {
            Some(key) => {
                sqlx::query(
                    r#"
                    INSERT INTO ota_command_correlation_keys (instance_id, correlation_key, registered_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (instance_id) DO UPDATE
                    SET correlation_key = EXCLUDED.correlation_key,
                        registered_at = EXCLUDED.registered_at
                    "#,
                )
                .bind(instance.instance_id.as_str())
                .bind(serde_json::to_value(&key)?)
                .bind(instance.last_updated_at)
                .execute(&mut **tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM ota_command_correlation_keys WHERE instance_id = $1")
                    .bind(instance.instance_id.as_str())
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }

    async fn locked_state(
        tx: &mut Transaction<'_, Postgres>,
        instance_id: &InstanceId,
    ) -> PersistenceResult<Option<CommandState>> {
        let row = sqlx::query(
            "SELECT state FROM ota_command_instances WHERE instance_id = $1 FOR UPDATE",
        )
        .bind(instance_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| -> PersistenceResult<CommandState> {
            let state: String = row.try_get("state")?;
            state
                .parse::<CommandState>()
                .map_err(|field| PersistenceError::InvalidData { field })
        })
        .transpose()
    }

    /// Command id and state of the row that refused a save
    async fn locked_owner(
        tx: &mut Transaction<'_, Postgres>,
        instance_id: &InstanceId,
    ) -> PersistenceResult<Option<(Uuid, CommandState)>> {
        let row = sqlx::query(
            "SELECT command_id, state FROM ota_command_instances WHERE instance_id = $1 FOR UPDATE",
        )
        .bind(instance_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| -> PersistenceResult<(Uuid, CommandState)> {
            let command_id: Uuid = row.try_get("command_id")?;
            let state: String = row.try_get("state")?;
            let state = state
                .parse::<CommandState>()
                .map_err(|field| PersistenceError::InvalidData { field })?;
            Ok((command_id, state))
        })
        .transpose()
    }

    fn decode(row: &sqlx::postgres::PgRow) -> PersistenceResult<OrchestrationInstance> {
        let document: serde_json::Value = row.try_get("instance")?;
        Ok(serde_json::from_value(document)?)
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn create(&self, instance: &OrchestrationInstance) -> PersistenceResult<CreateOutcome> {
        let mut tx = self.pool.begin().await?;

        let outcome = match Self::locked_state(&mut tx, &instance.instance_id).await? {
            None => {
                if Self::write_instance(&mut tx, INSERT_INSTANCE, instance).await? == 0 {
                    // A concurrent create won the insert race
                    let state = Self::locked_state(&mut tx, &instance.instance_id)
                        .await?
                        .unwrap_or(CommandState::Submitting);
                    CreateOutcome::AlreadyActive { state }
                } else {
                    CreateOutcome::Created
                }
            }
            Some(previous_state) if previous_state.is_terminal() => {
                Self::write_instance(&mut tx, REPLACE_INSTANCE, instance).await?;
                CreateOutcome::Replaced { previous_state }
            }
            Some(state) => CreateOutcome::AlreadyActive { state },
        };

        if !matches!(outcome, CreateOutcome::AlreadyActive { .. }) {
            Self::write_correlation_key(&mut tx, instance).await?;
        }
        tx.commit().await?;

        debug!(instance_id = %instance.instance_id, outcome = ?outcome, "Instance create");
        Ok(outcome)
    }

    async fn save(&self, instance: &OrchestrationInstance) -> PersistenceResult<()> {
        let mut tx = self.pool.begin().await?;
        if Self::write_instance(&mut tx, UPSERT_INSTANCE, instance).await? == 0 {
            let stored = Self::locked_owner(&mut tx, &instance.instance_id).await?;
            tx.rollback().await?;
            let instance_id = instance.instance_id.to_string();
            return Err(match stored {
                Some((command_id, state)) if command_id == instance.command_request.command_id => {
                    PersistenceError::AlreadyTerminal {
                        instance_id,
                        state: state.to_string(),
                    }
                }
                _ => PersistenceError::Superseded { instance_id },
            });
        }
        Self::write_correlation_key(&mut tx, instance).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, instance_id: &InstanceId) -> PersistenceResult<Option<OrchestrationInstance>> {
        let row = sqlx::query("SELECT instance FROM ota_command_instances WHERE instance_id = $1")
            .bind(instance_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn list(&self) -> PersistenceResult<Vec<OrchestrationInstance>> {
        let rows = sqlx::query("SELECT instance FROM ota_command_instances ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn delete(&self, instance_id: &InstanceId) -> PersistenceResult<bool> {
        let result = sqlx::query("DELETE FROM ota_command_instances WHERE instance_id = $1")
            .bind(instance_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
