//! Database module for property_assist
//!
//! Provides persistence for per-session conversation state.

mod schema;

pub use schema::*;

use crate::conversation::ConversationState;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored state is unreadable: {0}")]
    State(#[from] serde_json::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session already exists: {0}")]
    SessionExists(String),
    #[error("Database connection lock poisoned")]
    Poisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Session Operations ====================

    /// Create a session with an empty conversation
    pub fn create_session(&self, id: &str) -> DbResult<Session> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(DbError::SessionExists(id.to_string()));
        }

        let now = Utc::now();
        let state = ConversationState::default();
        conn.execute(
            "INSERT INTO sessions (id, state_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id, serde_json::to_string(&state)?, now.to_rfc3339()],
        )?;

        Ok(Session {
            id: id.to_string(),
            state,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get session by ID
    pub fn get_session(&self, id: &str) -> DbResult<Session> {
        self.find_session(id)?
            .ok_or_else(|| DbError::SessionNotFound(id.to_string()))
    }

    /// Get session by ID, `None` when it was never created or was deleted
    pub fn find_session(&self, id: &str) -> DbResult<Option<Session>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, state_json, created_at, updated_at FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, state_json, created_at, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Session {
            id,
            state: serde_json::from_str(&state_json)?,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        }))
    }

    /// Store the conversation state, creating the session on first save
    pub fn save_session_state(&self, id: &str, state: &ConversationState) -> DbResult<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO sessions (id, state_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
            params![id, serde_json::to_string(state)?, now],
        )?;
        Ok(())
    }

    /// Delete a session. Returns whether it existed.
    pub fn delete_session(&self, id: &str) -> DbResult<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Number of stored sessions
    pub fn session_count(&self) -> DbResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
