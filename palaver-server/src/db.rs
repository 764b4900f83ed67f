//! SQLite persistence layer.
//!
//! Holds the user directory (presence flag + last seen), the append-only
//! message store, and login accounts. Uses WAL mode for concurrent reads
//! during writes.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

use crate::msgid;
use crate::protocol::{MessageRecord, UserRecord};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
    /// Timestamp (ms) of the newest stored message. New messages never
    /// get an earlier timestamp, even if the wall clock steps back.
    last_message_ms: AtomicI64,
}

/// A persisted login account.
#[derive(Debug, Clone)]
pub struct AccountRow {
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Db {
    /// Open (or create) the database at the given path. `:memory:` opens a
    /// private in-memory database.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = if path.as_ref() == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                username  TEXT PRIMARY KEY,
                is_online INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                msgid     TEXT NOT NULL UNIQUE,
                sender    TEXT NOT NULL,
                receiver  TEXT NOT NULL,
                body      TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_pair_ts
                ON messages(sender, receiver, timestamp);

            CREATE TABLE IF NOT EXISTS accounts (
                username      TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                created_at    INTEGER NOT NULL
            );
            ",
        )?;
        let last: Option<i64> =
            conn.query_row("SELECT MAX(timestamp) FROM messages", [], |row| row.get(0))?;
        Ok(Self {
            conn,
            last_message_ms: AtomicI64::new(last.unwrap_or(0)),
        })
    }

    // ── User directory ─────────────────────────────────────────────────

    /// Look up one user's presence record.
    pub fn find_user(&self, username: &str) -> SqlResult<Option<UserRecord>> {
        self.conn
            .query_row(
                "SELECT username, is_online, last_seen FROM users WHERE username = ?1",
                params![username],
                map_user_row,
            )
            .optional()
    }

    /// Create or update a user's presence record.
    pub fn upsert_user(&self, username: &str, is_online: bool, last_seen: DateTime<Utc>) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO users (username, is_online, last_seen) VALUES (?1, ?2, ?3)
             ON CONFLICT(username) DO UPDATE SET
                is_online=excluded.is_online,
                last_seen=excluded.last_seen",
            params![username, is_online as i32, last_seen.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Mark an existing user offline. Unknown usernames are left absent.
    /// Returns the number of rows changed (0 or 1).
    pub fn mark_offline(&self, username: &str, last_seen: DateTime<Utc>) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE users SET is_online = 0, last_seen = ?2 WHERE username = ?1",
            params![username, last_seen.timestamp_millis()],
        )
    }

    /// Every known user, online first, then by username (byte order).
    pub fn list_users(&self) -> SqlResult<Vec<UserRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT username, is_online, last_seen FROM users
             ORDER BY is_online DESC, username ASC",
        )?;
        let rows = stmt.query_map([], map_user_row)?;
        rows.collect()
    }

    // ── Message store ──────────────────────────────────────────────────

    /// Append a message, assigning its ID and timestamp.
    pub fn append_message(&self, sender: &str, receiver: &str, body: &str) -> SqlResult<MessageRecord> {
        let now_ms = Utc::now().timestamp_millis();
        let ts_ms = self.last_message_ms.fetch_max(now_ms, Ordering::SeqCst).max(now_ms);
        let id = msgid::generate_at(ts_ms as u64);
        self.conn.execute(
            "INSERT INTO messages (msgid, sender, receiver, body, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, sender, receiver, body, ts_ms],
        )?;
        Ok(MessageRecord {
            id,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            body: body.to_string(),
            timestamp: millis_to_datetime(ts_ms),
        })
    }

    /// Messages exchanged between two users in either direction, oldest first.
    pub fn messages_between(&self, user_a: &str, user_b: &str) -> SqlResult<Vec<MessageRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT msgid, sender, receiver, body, timestamp
             FROM messages
             WHERE (sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1)
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![user_a, user_b], map_message_row)?;
        rows.collect()
    }

    // ── Accounts ───────────────────────────────────────────────────────

    /// Create an account. Returns `false` if the username is already taken.
    pub fn create_account(&self, username: &str, password_hash: &str) -> SqlResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO accounts (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
            params![username, password_hash, Utc::now().timestamp_millis()],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_account(&self, username: &str) -> SqlResult<Option<AccountRow>> {
        self.conn
            .query_row(
                "SELECT username, password_hash, created_at FROM accounts WHERE username = ?1",
                params![username],
                |row| {
                    Ok(AccountRow {
                        username: row.get(0)?,
                        password_hash: row.get(1)?,
                        created_at: millis_to_datetime(row.get(2)?),
                    })
                },
            )
            .optional()
    }

    /// Run raw SQL against the connection. Tests use this to break tables
    /// and exercise failure paths.
    #[doc(hidden)]
    pub fn execute_raw(&self, sql: &str) -> SqlResult<()> {
        self.conn.execute_batch(sql)
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn map_user_row(row: &rusqlite::Row) -> SqlResult<UserRecord> {
    Ok(UserRecord {
        username: row.get(0)?,
        is_online: row.get::<_, i32>(1)? != 0,
        last_seen: millis_to_datetime(row.get(2)?),
    })
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        sender: row.get(1)?,
        receiver: row.get(2)?,
        body: row.get(3)?,
        timestamp: millis_to_datetime(row.get(4)?),
    })
}
