//! Durable store over SQLite.
//!
//! Messages are document rows: the full [`AnnotatedMessage`] is serialized
//! into a JSON payload column and appended, never updated. Sessions, plans,
//! and summaries get their own tables. All access goes through one locked
//! connection.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::messages::AnnotatedMessage;
use crate::plan::WeeklyPlan;

pub const DEFAULT_TIMEZONE: &str = "UTC";

/// How long a finished check-in session stays reusable.
const CHECK_IN_REUSE_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct PlanRecord {
    pub plan_id: String,
    pub uid: String,
    pub chat_state: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub plan: WeeklyPlan,
    pub revision_message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub headline: String,
    pub long_summary: String,
}

pub struct ChatStore {
    conn: Mutex<Connection>,
}

impl ChatStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Database lock poisoned: {}", e))
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS users (
                uid TEXT PRIMARY KEY,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                chat_state TEXT NOT NULL DEFAULT 'onboarding',
                pending_message TEXT
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_sessions (
                uid TEXT NOT NULL,
                session_id TEXT NOT NULL,
                chat_state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                headline TEXT,
                summary TEXT,
                summary_timestamp TEXT,
                PRIMARY KEY (uid, session_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid TEXT NOT NULL,
                session_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_session
             ON chat_messages (uid, session_id, id)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS plans (
                plan_id TEXT PRIMARY KEY,
                uid TEXT NOT NULL,
                chat_state TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                payload TEXT NOT NULL,
                revision_message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS ambient_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid TEXT NOT NULL,
                caption TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    // --- users ---

    pub fn ensure_user(&self, uid: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("INSERT OR IGNORE INTO users (uid) VALUES (?1)", [uid])?;
        Ok(())
    }

    pub fn user_timezone(&self, uid: &str) -> Result<Tz> {
        let conn = self.lock_conn()?;
        let name: Option<String> = conn
            .query_row("SELECT timezone FROM users WHERE uid = ?1", [uid], |row| {
                row.get(0)
            })
            .optional()?;
        let name = name.unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        name.parse::<Tz>()
            .map_err(|e| anyhow!("User {} has invalid timezone '{}': {}", uid, name, e))
    }

    pub fn set_user_timezone(&self, uid: &str, timezone: &str) -> Result<()> {
        timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("Invalid timezone '{}': {}", timezone, e))?;
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE users SET timezone = ?2 WHERE uid = ?1",
            params![uid, timezone],
        )?;
        Ok(())
    }

    pub fn user_chat_state(&self, uid: &str) -> Result<String> {
        let conn = self.lock_conn()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT chat_state FROM users WHERE uid = ?1",
                [uid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.unwrap_or_else(|| "onboarding".to_string()))
    }

    pub fn set_user_chat_state(&self, uid: &str, chat_state: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE users SET chat_state = ?2 WHERE uid = ?1",
            params![uid, chat_state],
        )?;
        Ok(())
    }

    pub fn set_pending_message(&self, uid: &str, message: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE users SET pending_message = ?2 WHERE uid = ?1",
            params![uid, message],
        )?;
        Ok(())
    }

    /// Returns and clears the server-pushed opener, if one is waiting.
    pub fn take_pending_message(&self, uid: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let message: Option<String> = conn
            .query_row(
                "SELECT pending_message FROM users WHERE uid = ?1",
                [uid],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if message.is_some() {
            conn.execute(
                "UPDATE users SET pending_message = NULL WHERE uid = ?1",
                [uid],
            )?;
        }
        Ok(message)
    }

    // --- sessions ---

    pub fn new_session_id(now: DateTime<Utc>) -> String {
        format!("session-{}", now.to_rfc3339())
    }

    /// Resolves which session a fresh connection should land in, creating a
    /// new one when the continuity rules say so:
    /// onboarding always resumes its newest session; check-in resumes unless
    /// the newest session already said goodbye and is older than 24h;
    /// open chat resumes only a session started the same local day.
    pub fn resolve_session(
        &self,
        uid: &str,
        mode: &str,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> Result<String> {
        let newest = self.newest_session(uid, mode)?;

        let reusable = match (&newest, mode) {
            (None, _) => None,
            (Some((session_id, _)), "onboarding") => Some(session_id.clone()),
            (Some((session_id, created_at)), "check_in") => {
                let said_goodbye = self.session_reached_goodbye(uid, session_id)?;
                let expired = now - *created_at
                    > Duration::hours(CHECK_IN_REUSE_WINDOW_HOURS);
                if said_goodbye && expired {
                    None
                } else {
                    Some(session_id.clone())
                }
            }
            (Some((session_id, created_at)), _) => {
                let same_local_day = created_at.with_timezone(tz).date_naive()
                    == now.with_timezone(tz).date_naive();
                if same_local_day {
                    Some(session_id.clone())
                } else {
                    None
                }
            }
        };

        if let Some(session_id) = reusable {
            return Ok(session_id);
        }

        let session_id = Self::new_session_id(now);
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO chat_sessions (uid, session_id, chat_state, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![uid, session_id, mode, now.to_rfc3339()],
        )?;
        Ok(session_id)
    }

    fn newest_session(&self, uid: &str, mode: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let conn = self.lock_conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT session_id, created_at FROM chat_sessions
                 WHERE uid = ?1 AND chat_state = ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![uid, mode],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((session_id, created_at)) => {
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .context("Invalid session timestamp")?
                    .with_timezone(&Utc);
                Ok(Some((session_id, created_at)))
            }
            None => Ok(None),
        }
    }

    pub fn session_reached_goodbye(&self, uid: &str, session_id: &str) -> Result<bool> {
        Ok(self
            .load_history(uid, session_id)?
            .iter()
            .any(|m| m.end_state.as_deref() == Some("goodbye")))
    }

    // --- messages ---

    pub fn append_message(
        &self,
        uid: &str,
        session_id: &str,
        message: &AnnotatedMessage,
    ) -> Result<()> {
        let payload = serde_json::to_string(message).context("Failed to serialize message")?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO chat_messages (uid, session_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![uid, session_id, payload, message.timestamp.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_history(&self, uid: &str, session_id: &str) -> Result<Vec<AnnotatedMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM chat_messages
             WHERE uid = ?1 AND session_id = ?2 ORDER BY id ASC",
        )?;
        let payloads = stmt
            .query_map(params![uid, session_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|payload| {
                serde_json::from_str(payload).context("Failed to deserialize stored message")
            })
            .collect()
    }

    // --- summaries ---

    pub fn store_summary(
        &self,
        uid: &str,
        session_id: &str,
        headline: &str,
        long_summary: &str,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE chat_sessions
             SET headline = ?3, summary = ?4, summary_timestamp = ?5
             WHERE uid = ?1 AND session_id = ?2",
            params![uid, session_id, headline, long_summary, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn summaries(&self, uid: &str) -> Result<Vec<SessionSummary>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT headline, summary FROM chat_sessions
             WHERE uid = ?1 AND summary IS NOT NULL
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([uid], |row| {
                Ok(SessionSummary {
                    headline: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    long_summary: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- plans ---

    pub fn save_plan(&self, record: &PlanRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.plan).context("Failed to serialize plan")?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO plans
             (plan_id, uid, chat_state, start_date, end_date, payload, revision_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.plan_id,
                record.uid,
                record.chat_state,
                record.start_date.to_string(),
                record.end_date.to_string(),
                payload,
                record.revision_message,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The newest plan whose date range covers `date`.
    pub fn active_plan_for_date(&self, uid: &str, date: NaiveDate) -> Result<Option<PlanRecord>> {
        Ok(self
            .plan_history(uid, usize::MAX)?
            .into_iter()
            .find(|record| record.start_date <= date && date <= record.end_date))
    }

    /// Plans newest-first.
    pub fn plan_history(&self, uid: &str, limit: usize) -> Result<Vec<PlanRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT plan_id, uid, chat_state, start_date, end_date, payload,
                    revision_message, created_at
             FROM plans WHERE uid = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![uid, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(plan_id, uid, chat_state, start, end, payload, revision_message, created_at)| {
                    Ok(PlanRecord {
                        plan_id,
                        uid,
                        chat_state,
                        start_date: start.parse().context("Invalid plan start date")?,
                        end_date: end.parse().context("Invalid plan end date")?,
                        plan: serde_json::from_str(&payload)
                            .context("Failed to deserialize stored plan")?,
                        revision_message,
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .context("Invalid plan timestamp")?
                            .with_timezone(&Utc),
                    })
                },
            )
            .collect()
    }

    // --- ambient display entries ---

    pub fn add_ambient_entry(&self, uid: &str, caption: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO ambient_entries (uid, caption, created_at) VALUES (?1, ?2, ?3)",
            params![uid, caption, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn ambient_entries(&self, uid: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT caption FROM ambient_entries WHERE uid = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![uid, limit], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageKind, Role};
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn store_with_user() -> ChatStore {
        let store = ChatStore::in_memory().unwrap();
        store.ensure_user("u1").unwrap();
        store
    }

    #[test]
    fn message_round_trip_through_sqlite() {
        let store = store_with_user();
        let now = utc(2026, 3, 2, 10);
        let session = store
            .resolve_session("u1", "onboarding", now, &chrono_tz::UTC)
            .unwrap();

        let message = AnnotatedMessage::new(MessageKind::Message, Role::Assistant, "hello")
            .with_states("introduction", "introduction")
            .with_strategy("Filler");
        store.append_message("u1", &session, &message).unwrap();

        let history = store.load_history("u1", &session).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, message.id);
        assert_eq!(history[0].strategy.as_deref(), Some("Filler"));
    }

    #[test]
    fn file_backed_store_survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beebo.db");
        let now = utc(2026, 3, 2, 10);

        let session = {
            let store = ChatStore::new(&path).unwrap();
            store.ensure_user("u1").unwrap();
            store.set_user_timezone("u1", "America/New_York").unwrap();
            let session = store
                .resolve_session("u1", "onboarding", now, &chrono_tz::UTC)
                .unwrap();
            let message = AnnotatedMessage::new(MessageKind::Message, Role::User, "hi");
            store.append_message("u1", &session, &message).unwrap();
            session
        };

        let reopened = ChatStore::new(&path).unwrap();
        assert_eq!(
            reopened.user_timezone("u1").unwrap(),
            chrono_tz::America::New_York
        );
        let history = reopened.load_history("u1", &session).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[test]
    fn onboarding_always_resumes_its_newest_session() {
        let store = store_with_user();
        let first = store
            .resolve_session("u1", "onboarding", utc(2026, 3, 2, 10), &chrono_tz::UTC)
            .unwrap();
        // Weeks later, same session.
        let second = store
            .resolve_session("u1", "onboarding", utc(2026, 4, 1, 10), &chrono_tz::UTC)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn check_in_resumes_unless_goodbye_and_stale() {
        let store = store_with_user();
        let start = utc(2026, 3, 2, 10);
        let session = store
            .resolve_session("u1", "check_in", start, &chrono_tz::UTC)
            .unwrap();

        // Stale but no goodbye: still resumes.
        let resumed = store
            .resolve_session("u1", "check_in", start + Duration::hours(30), &chrono_tz::UTC)
            .unwrap();
        assert_eq!(session, resumed);

        let goodbye = AnnotatedMessage::new(MessageKind::Message, Role::Assistant, "bye")
            .with_states("goodbye", "goodbye");
        store.append_message("u1", &session, &goodbye).unwrap();

        // Goodbye but fresh: still resumes.
        let resumed = store
            .resolve_session("u1", "check_in", start + Duration::hours(2), &chrono_tz::UTC)
            .unwrap();
        assert_eq!(session, resumed);

        // Goodbye and stale: new session.
        let fresh = store
            .resolve_session("u1", "check_in", start + Duration::hours(30), &chrono_tz::UTC)
            .unwrap();
        assert_ne!(session, fresh);
    }

    #[test]
    fn open_chat_resumes_only_same_local_day() {
        let store = store_with_user();
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2026-03-02 23:00 in New York.
        let evening = utc(2026, 3, 3, 4);
        let session = store
            .resolve_session("u1", "at_will", evening, &tz)
            .unwrap();

        // Still the same local day: resumes.
        let later_same_day = evening + Duration::minutes(30);
        let resumed = store
            .resolve_session("u1", "at_will", later_same_day, &tz)
            .unwrap();
        assert_eq!(session, resumed);

        // Two hours later it is past midnight local time: new session.
        let after_midnight = evening + Duration::hours(2);
        let fresh = store
            .resolve_session("u1", "at_will", after_midnight, &tz)
            .unwrap();
        assert_ne!(session, fresh);
    }

    #[test]
    fn pending_message_is_taken_once() {
        let store = store_with_user();
        store.set_pending_message("u1", "time to move!").unwrap();
        assert_eq!(
            store.take_pending_message("u1").unwrap().as_deref(),
            Some("time to move!")
        );
        assert!(store.take_pending_message("u1").unwrap().is_none());
    }

    #[test]
    fn active_plan_lookup_prefers_newest_covering_plan() {
        let store = store_with_user();
        let plan = WeeklyPlan::default();
        let old = PlanRecord {
            plan_id: "p1".to_string(),
            uid: "u1".to_string(),
            chat_state: "onboarding".to_string(),
            start_date: "2026-03-02".parse().unwrap(),
            end_date: "2026-03-08".parse().unwrap(),
            plan: plan.clone(),
            revision_message: String::new(),
            created_at: utc(2026, 3, 2, 9),
        };
        let newer = PlanRecord {
            plan_id: "p2".to_string(),
            created_at: utc(2026, 3, 3, 9),
            revision_message: "added a walk".to_string(),
            ..old.clone()
        };
        store.save_plan(&old).unwrap();
        store.save_plan(&newer).unwrap();

        let active = store
            .active_plan_for_date("u1", "2026-03-05".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(active.plan_id, "p2");

        assert!(store
            .active_plan_for_date("u1", "2026-03-20".parse().unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn summaries_come_back_in_session_order() {
        let store = store_with_user();
        let s1 = store
            .resolve_session("u1", "at_will", utc(2026, 3, 2, 10), &chrono_tz::UTC)
            .unwrap();
        let s2 = store
            .resolve_session("u1", "at_will", utc(2026, 3, 3, 10), &chrono_tz::UTC)
            .unwrap();
        store.store_summary("u1", &s1, "First chat", "talked goals").unwrap();
        store.store_summary("u1", &s2, "Second chat", "adjusted plan").unwrap();

        let summaries = store.summaries("u1").unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].headline, "First chat");
        assert_eq!(summaries[1].headline, "Second chat");
    }
}
