//! Persistent SQLite store for preferences, conversation history and sessions.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::chatbot::message::{
    Attachment, ConversationTurn, DEFAULT_TEMPERATURE, NewTurn, PreferenceUpdate, Role,
    SessionState, UserPreference,
};

/// Number of turns replayed into a completion request.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid attachments column: {0}")]
    Attachments(#[from] serde_json::Error),
}

/// Persistent SQLite database for the bot.
pub struct Database {
    conn: Mutex<Connection>,
    default_bot: String,
}

impl Database {
    /// Open the database named by a connection string.
    ///
    /// Accepts `sqlite://path`, `sqlite:path`, `sqlite::memory:`, `:memory:`
    /// or a bare file path.
    pub fn open(url: &str, default_bot: impl Into<String>) -> Result<Self, StoreError> {
        let target = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);

        let conn = if target.is_empty() || target == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(Path::new(target))?
        };

        let db = Self::with_connection(conn, default_bot)?;
        let (users, turns) = db.get_counts()?;
        info!("Loaded database from {url} ({users} users, {turns} turns)");
        Ok(db)
    }

    /// Create a new in-memory database.
    pub fn in_memory(default_bot: impl Into<String>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, default_bot)
    }

    fn with_connection(conn: Connection, default_bot: impl Into<String>) -> Result<Self, StoreError> {
        let db = Self {
            conn: Mutex::new(conn),
            default_bot: default_bot.into(),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn();

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id INTEGER PRIMARY KEY,
                bot_name TEXT NOT NULL,
                system_prompt TEXT NOT NULL DEFAULT '',
                temperature REAL NOT NULL DEFAULT 0.7
            );

            CREATE TABLE IF NOT EXISTS conversation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                bot_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_sessions (
                user_id INTEGER PRIMARY KEY,
                state TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_user_time
                ON conversation_history(user_id, timestamp);
        "#)?;

        // Databases created before attachments were recorded lack the column.
        let has_attachments: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('conversation_history') WHERE name = 'attachments'",
            [],
            |row| row.get(0),
        )?;
        if !has_attachments {
            info!("Adding attachments column to conversation_history");
            conn.execute(
                "ALTER TABLE conversation_history ADD COLUMN attachments TEXT NOT NULL DEFAULT '[]'",
                [],
            )?;
        }

        Ok(())
    }

    fn get_counts(&self) -> Result<(usize, usize), StoreError> {
        let conn = self.conn();
        let users: i64 = conn.query_row("SELECT COUNT(*) FROM user_preferences", [], |row| row.get(0))?;
        let turns: i64 = conn.query_row("SELECT COUNT(*) FROM conversation_history", [], |row| row.get(0))?;
        Ok((users as usize, turns as usize))
    }

    /// Model used for users without a stored preference.
    pub fn default_bot(&self) -> &str {
        &self.default_bot
    }

    // ==================== PREFERENCES ====================

    /// Read a user's preference, or the defaults if none is stored.
    pub fn get_preference(&self, user_id: i64) -> Result<UserPreference, StoreError> {
        let conn = self.conn();
        let stored = conn
            .query_row(
                "SELECT bot_name, system_prompt, temperature FROM user_preferences WHERE user_id = ?1",
                params![user_id],
                |row| Ok(UserPreference {
                    bot_name: row.get(0)?,
                    system_prompt: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    temperature: row.get::<_, Option<f64>>(2)?.unwrap_or(DEFAULT_TEMPERATURE),
                }),
            )
            .optional()?;

        Ok(stored.unwrap_or_else(|| UserPreference::defaults(&self.default_bot)))
    }

    /// Apply a partial update, creating the row with defaults if needed.
    pub fn update_preference(&self, user_id: i64, update: &PreferenceUpdate) -> Result<(), StoreError> {
        if update.is_empty() {
            return Ok(());
        }

        self.conn().execute(
            "INSERT INTO user_preferences (user_id, bot_name, system_prompt, temperature)
             VALUES (?1, COALESCE(?2, ?5), COALESCE(?3, ''), COALESCE(?4, ?6))
             ON CONFLICT(user_id) DO UPDATE SET
                bot_name = COALESCE(?2, bot_name),
                system_prompt = COALESCE(?3, system_prompt),
                temperature = COALESCE(?4, temperature)",
            params![
                user_id,
                update.bot_name,
                update.system_prompt,
                update.temperature,
                self.default_bot,
                DEFAULT_TEMPERATURE,
            ],
        )?;
        Ok(())
    }

    /// Overwrite every field of a user's preference.
    pub fn reset_preference(&self, user_id: i64, preference: &UserPreference) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO user_preferences (user_id, bot_name, system_prompt, temperature)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, preference.bot_name, preference.system_prompt, preference.temperature],
        )?;
        Ok(())
    }

    // ==================== HISTORY ====================

    /// Append a turn to the user's history. Returns the new turn's id.
    pub fn append_turn(&self, turn: &NewTurn) -> Result<i64, StoreError> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let attachments = serde_json::to_string(&turn.attachments)?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO conversation_history (user_id, timestamp, role, content, bot_name, attachments)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![turn.user_id, timestamp, turn.role.as_str(), turn.content, turn.bot_name, attachments],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The most recent `limit` turns of a user, oldest first.
    pub fn recent_turns(&self, user_id: i64, limit: usize) -> Result<Vec<ConversationTurn>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, timestamp, role, content, bot_name, attachments
             FROM conversation_history
             WHERE user_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            let role: String = row.get(3)?;
            let role = role.parse::<Role>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
            })?;

            let turn = ConversationTurn {
                id: row.get(0)?,
                user_id: row.get(1)?,
                timestamp: row.get(2)?,
                role,
                content: row.get(4)?,
                bot_name: row.get(5)?,
                attachments: Vec::new(),
            };
            Ok((turn, row.get::<_, String>(6)?))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (mut turn, attachments) = row?;
            turn.attachments = serde_json::from_str::<Vec<Attachment>>(&attachments)?;
            result.push(turn);
        }

        result.reverse();
        Ok(result)
    }

    /// Delete every turn of one user. Returns the number of deleted turns.
    pub fn clear_history(&self, user_id: i64) -> Result<usize, StoreError> {
        let deleted = self.conn().execute(
            "DELETE FROM conversation_history WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(deleted)
    }

    // ==================== SESSIONS ====================

    pub fn set_session(&self, user_id: i64, state: SessionState) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO user_sessions (user_id, state) VALUES (?1, ?2)",
            params![user_id, state.as_str()],
        )?;
        Ok(())
    }

    /// Read and clear a user's session state.
    pub fn take_session(&self, user_id: i64) -> Result<Option<SessionState>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM user_sessions WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;

        if state.is_some() {
            tx.execute("DELETE FROM user_sessions WHERE user_id = ?1", params![user_id])?;
        }
        tx.commit()?;

        Ok(state.as_deref().and_then(SessionState::parse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::in_memory("GPT-4o").unwrap()
    }

    fn user_turn(user_id: i64, text: &str) -> NewTurn {
        NewTurn::new(user_id, Role::User, text, "GPT-4o")
    }

    #[test]
    fn test_missing_preference_returns_defaults() {
        let db = db();
        let pref = db.get_preference(42).unwrap();
        assert_eq!(pref, UserPreference::defaults("GPT-4o"));
        assert_eq!(db.get_counts().unwrap(), (0, 0));
    }

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let db = db();
        db.update_preference(1, &PreferenceUpdate::system_prompt("be brief")).unwrap();
        db.update_preference(1, &PreferenceUpdate::temperature(0.3)).unwrap();
        db.update_preference(1, &PreferenceUpdate::bot_name("Claude-3.5-Sonnet")).unwrap();

        let pref = db.get_preference(1).unwrap();
        assert_eq!(pref.bot_name, "Claude-3.5-Sonnet");
        assert_eq!(pref.system_prompt, "be brief");
        assert_eq!(pref.temperature, 0.3);
    }

    #[test]
    fn test_first_update_fills_defaults() {
        let db = db();
        db.update_preference(7, &PreferenceUpdate::temperature(0.1)).unwrap();

        let pref = db.get_preference(7).unwrap();
        assert_eq!(pref.bot_name, "GPT-4o");
        assert_eq!(pref.system_prompt, "");
        assert_eq!(pref.temperature, 0.1);
    }

    #[test]
    fn test_empty_update_creates_nothing() {
        let db = db();
        db.update_preference(7, &PreferenceUpdate::default()).unwrap();
        assert_eq!(db.get_counts().unwrap(), (0, 0));
    }

    #[test]
    fn test_reset_overwrites_everything() {
        let db = db();
        db.update_preference(1, &PreferenceUpdate::temperature(0.9)).unwrap();
        db.reset_preference(1, &UserPreference {
            bot_name: "GPT-4.1".to_string(),
            system_prompt: "hi".to_string(),
            temperature: 0.7,
        }).unwrap();

        let pref = db.get_preference(1).unwrap();
        assert_eq!(pref.bot_name, "GPT-4.1");
        assert_eq!(pref.system_prompt, "hi");
        assert_eq!(pref.temperature, 0.7);
    }

    #[test]
    fn test_recent_turns_are_latest_in_chronological_order() {
        let db = db();
        for i in 0..12 {
            db.append_turn(&user_turn(1, &format!("msg {i}"))).unwrap();
        }

        let turns = db.recent_turns(1, DEFAULT_HISTORY_LIMIT).unwrap();
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        let expected: Vec<String> = (2..12).map(|i| format!("msg {i}")).collect();
        assert_eq!(contents, expected);
        assert!(turns.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn test_turns_keep_role_and_attachments() {
        let db = db();
        let attachment = Attachment {
            url: "https://pfst.cf2.poecdn.net/base/image/abc".to_string(),
            content_type: "image/jpeg".to_string(),
            name: "photo.jpg".to_string(),
            parsed_content: None,
        };
        db.append_turn(&user_turn(1, "look").with_attachments(vec![attachment.clone()])).unwrap();
        db.append_turn(&NewTurn::new(1, Role::Bot, "nice photo", "GPT-4o")).unwrap();

        let turns = db.recent_turns(1, 10).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].attachments, vec![attachment]);
        assert_eq!(turns[1].role, Role::Bot);
        assert!(turns[1].attachments.is_empty());
    }

    #[test]
    fn test_clear_history_is_scoped_to_user() {
        let db = db();
        db.append_turn(&user_turn(1, "a")).unwrap();
        db.append_turn(&user_turn(1, "b")).unwrap();
        db.append_turn(&user_turn(2, "c")).unwrap();

        assert_eq!(db.clear_history(1).unwrap(), 2);
        assert!(db.recent_turns(1, 10).unwrap().is_empty());
        assert_eq!(db.recent_turns(2, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_take_session_clears_it() {
        let db = db();
        assert_eq!(db.take_session(1).unwrap(), None);

        db.set_session(1, SessionState::AwaitingBotName).unwrap();
        assert_eq!(db.take_session(2).unwrap(), None);
        assert_eq!(db.take_session(1).unwrap(), Some(SessionState::AwaitingBotName));
        assert_eq!(db.take_session(1).unwrap(), None);
    }

    #[test]
    fn test_open_file_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("bot.db").display());

        {
            let db = Database::open(&url, "GPT-4o").unwrap();
            db.update_preference(5, &PreferenceUpdate::bot_name("GPT-4.1")).unwrap();
            db.append_turn(&user_turn(5, "hello")).unwrap();
        }

        let db = Database::open(&url, "GPT-4o").unwrap();
        assert_eq!(db.get_preference(5).unwrap().bot_name, "GPT-4.1");
        assert_eq!(db.recent_turns(5, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_open_memory_urls() {
        for url in [":memory:", "sqlite::memory:", "sqlite://:memory:"] {
            let db = Database::open(url, "GPT-4o").unwrap();
            assert_eq!(db.default_bot(), "GPT-4o");
        }
    }

    #[test]
    fn test_upgrades_history_without_attachments_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(r#"
                CREATE TABLE conversation_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    timestamp TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    bot_name TEXT NOT NULL
                );
                INSERT INTO conversation_history (user_id, timestamp, role, content, bot_name)
                VALUES (9, '2025-01-01T10:00:00', 'user', 'old message', 'GPT-4o');
            "#).unwrap();
        }

        let db = Database::open(path.to_str().unwrap(), "GPT-4o").unwrap();
        let turns = db.recent_turns(9, 10).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "old message");
        assert!(turns[0].attachments.is_empty());
    }

    #[test]
    fn test_unknown_role_is_an_error() {
        let db = db();
        db.conn().execute(
            "INSERT INTO conversation_history (user_id, timestamp, role, content, bot_name)
             VALUES (1, '2025-01-01T10:00:00Z', 'assistant', 'x', 'GPT-4o')",
            [],
        ).unwrap();
        assert!(matches!(db.recent_turns(1, 10), Err(StoreError::Sqlite(_))));
    }
}
