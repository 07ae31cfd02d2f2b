use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, ToSql};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::model::{App, CONFIG_LAST_ERROR, EventStatus, Trigger, TriggerEvent, TriggerStatus};

/// SQLite-backed store for triggers and their events.
///
/// Verification tokens are envelope-encrypted before they touch the trigger
/// row and decrypted on read, so callers only ever see the plaintext secret.
/// Event dedup relies on the partial UNIQUE index over
/// (trigger_id, external_event_id) and `INSERT OR IGNORE`, never on
/// SELECT-then-INSERT.
pub struct Database {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

/// Filters for `list_triggers`.
#[derive(Debug, Default, Clone)]
pub struct TriggerFilter {
    pub status: Option<TriggerStatus>,
    pub app: Option<App>,
}

/// Filters for `list_events`.
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pub trigger_id: Option<String>,
    pub status: Option<EventStatus>,
    pub received_after: Option<DateTime<Utc>>,
    pub received_before: Option<DateTime<Utc>>,
}

/// True when an INSERT failed because a UNIQUE constraint tripped.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Database {
    /// Open (or create) the database at `path` and run migrations.
    /// Use `":memory:"` for an in-memory database (useful for tests).
    pub fn open(path: &str, cipher: TokenCipher) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        // WAL for concurrent reads; foreign keys for event cascade on delete
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self { conn: Mutex::new(conn), cipher };
        db.create_schema()?;
        info!(path = %path, "Database opened and schema verified");
        Ok(db)
    }

    fn create_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS triggers (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                app TEXT NOT NULL,
                linked_account_id TEXT NOT NULL,
                trigger_name TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                webhook_url TEXT NOT NULL,
                verification_token TEXT NOT NULL,
                external_webhook_id TEXT,
                config TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_triggered_at TEXT,
                expires_at TEXT,
                UNIQUE (project_id, app, linked_account_id, trigger_name)
            );

            CREATE INDEX IF NOT EXISTS idx_triggers_project ON triggers (project_id);
            CREATE INDEX IF NOT EXISTS idx_triggers_status ON triggers (status);
            CREATE INDEX IF NOT EXISTS idx_triggers_app ON triggers (app);
            CREATE INDEX IF NOT EXISTS idx_triggers_expires_at ON triggers (expires_at);

            CREATE TABLE IF NOT EXISTS trigger_events (
                id TEXT PRIMARY KEY,
                trigger_id TEXT NOT NULL REFERENCES triggers(id) ON DELETE CASCADE,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                external_event_id TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                received_at TEXT NOT NULL,
                processed_at TEXT,
                delivered_at TEXT,
                expires_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_dedup
                ON trigger_events (trigger_id, external_event_id)
                WHERE external_event_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_events_trigger ON trigger_events (trigger_id);
            CREATE INDEX IF NOT EXISTS idx_events_status ON trigger_events (status);
            CREATE INDEX IF NOT EXISTS idx_events_received_at ON trigger_events (received_at);
            ",
        )?;
        Ok(())
    }

    // ── Triggers ────────────────────────────────────────────────────────

    /// Persist a new trigger row. Fails with a UNIQUE violation when the
    /// (project, app, linked account, trigger_name) tuple already exists;
    /// callers map that to a CONFLICT.
    pub fn create_trigger(&self, trigger: &Trigger) -> Result<(), rusqlite::Error> {
        let token = self
            .cipher
            .encrypt(&trigger.verification_token)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let config = serde_json::to_string(&trigger.config)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO triggers \
             (id, project_id, app, linked_account_id, trigger_name, trigger_type, \
              webhook_url, verification_token, external_webhook_id, config, status, \
              created_at, updated_at, last_triggered_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                trigger.id,
                trigger.project_id,
                trigger.app.as_str(),
                trigger.linked_account_id,
                trigger.trigger_name,
                trigger.trigger_type,
                trigger.webhook_url,
                token,
                trigger.external_webhook_id,
                config,
                trigger.status.as_str(),
                trigger.created_at,
                trigger.updated_at,
                trigger.last_triggered_at,
                trigger.expires_at,
            ],
        )?;
        debug!(trigger_id = %trigger.id, app = %trigger.app, "Inserted trigger");
        Ok(())
    }

    const TRIGGER_COLUMNS: &'static str = "id, project_id, app, linked_account_id, \
         trigger_name, trigger_type, webhook_url, verification_token, \
         external_webhook_id, config, status, created_at, updated_at, \
         last_triggered_at, expires_at";

    fn map_trigger_row(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<Trigger> {
        let app_raw: String = row.get(2)?;
        let app = App::parse(&app_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown app {app_raw}").into(),
            )
        })?;
        let token_raw: String = row.get(7)?;
        let verification_token = self
            .cipher
            .decrypt(&token_raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
        let config_raw: String = row.get(9)?;
        let config: Map<String, Value> = serde_json::from_str(&config_raw).unwrap_or_default();
        let status_raw: String = row.get(10)?;
        let status = TriggerStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                10,
                Type::Text,
                format!("unknown status {status_raw}").into(),
            )
        })?;

        Ok(Trigger {
            id: row.get(0)?,
            project_id: row.get(1)?,
            app,
            linked_account_id: row.get(3)?,
            trigger_name: row.get(4)?,
            trigger_type: row.get(5)?,
            webhook_url: row.get(6)?,
            verification_token,
            external_webhook_id: row.get(8)?,
            config,
            status,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            last_triggered_at: row.get(13)?,
            expires_at: row.get(14)?,
        })
    }

    pub fn get_trigger(&self, id: &str) -> Result<Option<Trigger>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM triggers WHERE id = ?1",
            Self::TRIGGER_COLUMNS
        ))?;
        stmt.query_row(rusqlite::params![id], |row| self.map_trigger_row(row))
            .optional()
    }

    pub fn get_trigger_by_webhook_url(
        &self,
        url: &str,
    ) -> Result<Option<Trigger>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM triggers WHERE webhook_url = ?1",
            Self::TRIGGER_COLUMNS
        ))?;
        stmt.query_row(rusqlite::params![url], |row| self.map_trigger_row(row))
            .optional()
    }

    /// List a project's triggers, optionally filtered by status and app,
    /// newest first.
    pub fn list_triggers(
        &self,
        project_id: &str,
        filter: &TriggerFilter,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<Trigger>, rusqlite::Error> {
        let mut sql = format!(
            "SELECT {} FROM triggers WHERE project_id = ?1",
            Self::TRIGGER_COLUMNS
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(project_id.to_string())];
        if let Some(status) = filter.status {
            params.push(Box::new(status.as_str()));
            sql.push_str(&format!(" AND status = ?{}", params.len()));
        }
        if let Some(app) = filter.app {
            params.push(Box::new(app.as_str()));
            sql.push_str(&format!(" AND app = ?{}", params.len()));
        }
        let per_page = per_page.clamp(1, 500);
        sql.push_str(&format!(
            " ORDER BY created_at DESC LIMIT {per_page} OFFSET {}",
            page.saturating_mul(per_page)
        ));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| self.map_trigger_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Update a trigger's status; an optional error reason is recorded in
    /// the config map under `last_error`.
    pub fn update_trigger_status(
        &self,
        id: &str,
        status: TriggerStatus,
        error: Option<&str>,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let updated = match error {
            None => conn.execute(
                "UPDATE triggers SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), Utc::now(), id],
            )?,
            Some(reason) => {
                let config_raw: Option<String> = conn
                    .query_row(
                        "SELECT config FROM triggers WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(config_raw) = config_raw else { return Ok(false) };
                let mut config: Map<String, Value> =
                    serde_json::from_str(&config_raw).unwrap_or_default();
                config.insert(CONFIG_LAST_ERROR.to_string(), Value::String(reason.to_string()));
                let config = serde_json::to_string(&config)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                conn.execute(
                    "UPDATE triggers SET status = ?1, config = ?2, updated_at = ?3 WHERE id = ?4",
                    rusqlite::params![status.as_str(), config, Utc::now(), id],
                )?
            }
        };
        Ok(updated > 0)
    }

    pub fn update_trigger_external_id(
        &self,
        id: &str,
        external_webhook_id: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE triggers SET external_webhook_id = ?1, expires_at = ?2, updated_at = ?3 \
             WHERE id = ?4",
            rusqlite::params![external_webhook_id, expires_at, Utc::now(), id],
        )?;
        Ok(updated > 0)
    }

    pub fn update_trigger_expiry(
        &self,
        id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE triggers SET expires_at = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![expires_at, Utc::now(), id],
        )?;
        Ok(updated > 0)
    }

    /// Replace a trigger's config map wholesale.
    pub fn update_trigger_config(
        &self,
        id: &str,
        config: &Map<String, Value>,
    ) -> Result<bool, rusqlite::Error> {
        let config = serde_json::to_string(config)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE triggers SET config = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![config, Utc::now(), id],
        )?;
        Ok(updated > 0)
    }

    /// Best-effort bookkeeping after a successful ingest.
    pub fn set_last_triggered(&self, id: &str, at: DateTime<Utc>) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE triggers SET last_triggered_at = ?1 WHERE id = ?2",
            rusqlite::params![at, id],
        )?;
        Ok(updated > 0)
    }

    /// Delete a trigger; its events go with it via the FK cascade.
    pub fn delete_trigger(&self, id: &str) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM triggers WHERE id = ?1", rusqlite::params![id])?;
        Ok(deleted > 0)
    }

    pub fn count_triggers_by_status(&self, status: TriggerStatus) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM triggers WHERE status = ?1",
            rusqlite::params![status.as_str()],
            |row| row.get(0),
        )
    }

    pub fn count_triggers(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM triggers", [], |row| row.get(0))
    }

    // ── Scheduler queries ───────────────────────────────────────────────

    /// ACTIVE triggers whose subscription expires within `within` from now.
    pub fn find_expiring_triggers(&self, within: Duration) -> Result<Vec<Trigger>, rusqlite::Error> {
        let cutoff = Utc::now() + within;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM triggers \
             WHERE status = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= ?1",
            Self::TRIGGER_COLUMNS
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![cutoff], |row| self.map_trigger_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// ACTIVE triggers whose expiry has already passed.
    pub fn find_expired_triggers(&self) -> Result<Vec<Trigger>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM triggers \
             WHERE status = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= ?1",
            Self::TRIGGER_COLUMNS
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![Utc::now()], |row| self.map_trigger_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// ERROR triggers eligible for a registration retry: fewer than
    /// `max_attempts` attempts so far, last attempt at least `min_wait` ago.
    ///
    /// The SQL filters on status; the attempt bookkeeping lives in the
    /// config JSON and is filtered here.
    pub fn find_failed_registrations(
        &self,
        min_wait: Duration,
        max_attempts: u64,
    ) -> Result<Vec<Trigger>, rusqlite::Error> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM triggers WHERE status = 'ERROR'",
                Self::TRIGGER_COLUMNS
            ))?;
            stmt.query_map([], |row| self.map_trigger_row(row))?
                .collect::<Result<Vec<_>, _>>()?
        };
        let cutoff = Utc::now() - min_wait;
        Ok(rows
            .into_iter()
            .filter(|t| t.retry_count() < max_attempts)
            .filter(|t| t.last_attempt_at().is_none_or(|at| at <= cutoff))
            .collect())
    }

    // ── Events ──────────────────────────────────────────────────────────

    /// Insert one received delivery, deduplicating on
    /// (trigger_id, external_event_id).
    ///
    /// Returns the stored row and whether it was newly inserted. On a
    /// duplicate the existing row is returned, carrying the event_data of
    /// the first accepted delivery.
    pub fn create_trigger_event(
        &self,
        trigger_id: &str,
        event_type: &str,
        event_data: &Value,
        external_event_id: Option<&str>,
        retention: Duration,
    ) -> Result<(TriggerEvent, bool), rusqlite::Error> {
        let now = Utc::now();
        let event = TriggerEvent {
            id: Uuid::new_v4().to_string(),
            trigger_id: trigger_id.to_string(),
            event_type: event_type.to_string(),
            event_data: event_data.clone(),
            external_event_id: external_event_id.map(str::to_string),
            status: EventStatus::Pending,
            error_message: None,
            received_at: now,
            processed_at: None,
            delivered_at: None,
            expires_at: now + retention,
        };
        let data = serde_json::to_string(event_data)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO trigger_events \
             (id, trigger_id, event_type, event_data, external_event_id, status, \
              error_message, received_at, processed_at, delivered_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, NULL, NULL, ?8)",
            rusqlite::params![
                event.id,
                event.trigger_id,
                event.event_type,
                data,
                event.external_event_id,
                event.status.as_str(),
                event.received_at,
                event.expires_at,
            ],
        )?;

        if inserted > 0 {
            return Ok((event, true));
        }

        // The unique index tripped: hand back the row from the first
        // accepted delivery.
        let external = external_event_id.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        let mut stmt = conn.prepare(
            "SELECT id, trigger_id, event_type, event_data, external_event_id, status, \
                    error_message, received_at, processed_at, delivered_at, expires_at \
             FROM trigger_events WHERE trigger_id = ?1 AND external_event_id = ?2",
        )?;
        let existing =
            stmt.query_row(rusqlite::params![trigger_id, external], Self::map_event_row)?;
        Ok((existing, false))
    }

    fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TriggerEvent> {
        let data_raw: String = row.get(3)?;
        let event_data = serde_json::from_str(&data_raw).unwrap_or(Value::Null);
        let status_raw: String = row.get(5)?;
        let status = EventStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                format!("unknown event status {status_raw}").into(),
            )
        })?;
        Ok(TriggerEvent {
            id: row.get(0)?,
            trigger_id: row.get(1)?,
            event_type: row.get(2)?,
            event_data,
            external_event_id: row.get(4)?,
            status,
            error_message: row.get(6)?,
            received_at: row.get(7)?,
            processed_at: row.get(8)?,
            delivered_at: row.get(9)?,
            expires_at: row.get(10)?,
        })
    }

    /// Advance an event through its lifecycle; DELIVERED stamps
    /// delivered_at, every transition stamps processed_at.
    pub fn mark_event(
        &self,
        id: &str,
        status: EventStatus,
        error: Option<&str>,
    ) -> Result<bool, rusqlite::Error> {
        let now = Utc::now();
        let delivered_at = (status == EventStatus::Delivered).then_some(now);
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE trigger_events SET status = ?1, error_message = ?2, processed_at = ?3, \
             delivered_at = COALESCE(?4, delivered_at) WHERE id = ?5",
            rusqlite::params![status.as_str(), error, now, delivered_at, id],
        )?;
        Ok(updated > 0)
    }

    /// List events, newest first, with optional trigger/status/time filters.
    pub fn list_events(
        &self,
        filter: &EventFilter,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<TriggerEvent>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, trigger_id, event_type, event_data, external_event_id, status, \
                    error_message, received_at, processed_at, delivered_at, expires_at \
             FROM trigger_events WHERE 1=1",
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(trigger_id) = &filter.trigger_id {
            params.push(Box::new(trigger_id.clone()));
            sql.push_str(&format!(" AND trigger_id = ?{}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(Box::new(status.as_str()));
            sql.push_str(&format!(" AND status = ?{}", params.len()));
        }
        if let Some(after) = filter.received_after {
            params.push(Box::new(after));
            sql.push_str(&format!(" AND received_at >= ?{}", params.len()));
        }
        if let Some(before) = filter.received_before {
            params.push(Box::new(before));
            sql.push_str(&format!(" AND received_at < ?{}", params.len()));
        }
        let per_page = per_page.clamp(1, 500);
        sql.push_str(&format!(
            " ORDER BY received_at DESC LIMIT {per_page} OFFSET {}",
            page.saturating_mul(per_page)
        ));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), Self::map_event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_events_by_status(&self, status: EventStatus) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM trigger_events WHERE status = ?1",
            rusqlite::params![status.as_str()],
            |row| row.get(0),
        )
    }

    /// Delete events past their retention expiry. Returns how many rows
    /// were removed.
    pub fn cleanup_events_past_expiry(&self) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM trigger_events WHERE expires_at <= ?1",
            rusqlite::params![Utc::now()],
        )?;
        if deleted > 0 {
            debug!(count = deleted, "Removed events past retention expiry");
        }
        Ok(deleted)
    }
}
