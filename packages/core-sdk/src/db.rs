use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
    thread,
    time::Duration,
};
use time::{macros::format_description, OffsetDateTime};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::models::{Role, Source, SourceKind, StoredMessage, StoredSource, Thread};

/** \brief Title given to lazily created threads. */
pub const DEFAULT_THREAD_TITLE: &str = "New conversation";

/** \brief Reply recorded for a user turn that a crash left unanswered. */
pub const INTERRUPTED_REPLY: &str =
    "[interrupted] The hub stopped before this message was answered. Please send it again.";

/**
 * \brief Opens the hub database file with WAL-friendly settings.
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief Creates the conversation tables.
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;
        CREATE TABLE IF NOT EXISTS threads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            provider TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, id);

        CREATE TABLE IF NOT EXISTS message_sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            detail TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sources_message ON message_sources(message_id);
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief Millisecond UTC timestamp; fixed width, so text order is time order.
 */
pub fn now_stamp() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
        ))
        .unwrap_or_else(|_| "1970-01-01T00:00:00.000Z".to_string())
}

fn map_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

/**
 * \brief Conversation threads, messages and source annotations.
 * \details One connection behind a mutex: every call is a short critical
 * section and each write runs in its own transaction.
 */
pub struct ThreadStore {
    conn: Mutex<Connection>,
}

impl ThreadStore {
    /** \brief Wraps `conn`, running migrations first. */
    pub fn new(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(open_db(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("thread store connection poisoned"))
    }

    fn write<T, F>(&self, mut action: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut conn = self.lock()?;
        retry_on_locked(|| {
            let tx = conn.transaction()?;
            let value = action(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /**
     * \brief Returns thread `id`, or with `None` the most recently updated thread,
     * creating a default-titled one when the store is empty.
     */
    pub fn resolve_or_create_thread(&self, id: Option<i64>) -> Result<Thread, GatewayError> {
        if let Some(id) = id {
            return self.get_thread(id)?.ok_or(GatewayError::ThreadNotFound(id));
        }
        let thread = self.write(|tx| {
            let existing = tx
                .query_row(
                    "SELECT id, title, created_at, updated_at FROM threads
                     ORDER BY updated_at DESC, id DESC LIMIT 1",
                    [],
                    map_thread,
                )
                .optional()?;
            if let Some(thread) = existing {
                return Ok(thread);
            }
            insert_thread(tx, DEFAULT_THREAD_TITLE)
        })?;
        Ok(thread)
    }

    /**
     * \brief Creates a thread; blank titles get the default one.
     */
    pub fn create_thread(&self, title: Option<&str>) -> Result<Thread> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_THREAD_TITLE)
            .to_string();
        let thread = self.write(|tx| insert_thread(tx, &title))?;
        info!(thread_id = thread.id, "thread created");
        Ok(thread)
    }

    pub fn get_thread(&self, id: i64) -> Result<Option<Thread>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, title, created_at, updated_at FROM threads WHERE id=?1",
            params![id],
            map_thread,
        )
        .optional()
        .map_err(Into::into)
    }

    /** \brief Most recently updated thread, if any. */
    pub fn latest_thread(&self) -> Result<Option<Thread>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, title, created_at, updated_at FROM threads
             ORDER BY updated_at DESC, id DESC LIMIT 1",
            [],
            map_thread,
        )
        .optional()
        .map_err(Into::into)
    }

    /** \brief Threads, most recently updated first. */
    pub fn list_threads(&self) -> Result<Vec<Thread>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at FROM threads ORDER BY updated_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map([], map_thread)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn rename_thread(&self, id: i64, title: &str) -> Result<Thread, GatewayError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(GatewayError::EmptyTitle);
        }
        let rows = self.write(|tx| {
            tx.execute(
                "UPDATE threads SET title=?1, updated_at=?2 WHERE id=?3",
                params![title, now_stamp(), id],
            )
        })?;
        if rows == 0 {
            return Err(GatewayError::ThreadNotFound(id));
        }
        self.get_thread(id)?.ok_or(GatewayError::ThreadNotFound(id))
    }

    /**
     * \brief Deletes a thread with its messages and sources.
     * \details Refused when it is the only thread left.
     */
    pub fn delete_thread(&self, id: i64) -> Result<(), GatewayError> {
        enum Outcome {
            Deleted,
            Missing,
            Last,
        }
        let outcome = self.write(|tx| {
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM threads WHERE id=?1", params![id], |r| r.get(0))
                .optional()?;
            if exists.is_none() {
                return Ok(Outcome::Missing);
            }
            let total: i64 = tx.query_row("SELECT COUNT(*) FROM threads", [], |r| r.get(0))?;
            if total <= 1 {
                return Ok(Outcome::Last);
            }
            tx.execute(
                "DELETE FROM message_sources WHERE message_id IN
                 (SELECT id FROM messages WHERE thread_id=?1)",
                params![id],
            )?;
            tx.execute("DELETE FROM messages WHERE thread_id=?1", params![id])?;
            tx.execute("DELETE FROM threads WHERE id=?1", params![id])?;
            Ok(Outcome::Deleted)
        })?;
        match outcome {
            Outcome::Deleted => {
                info!(thread_id = id, "thread deleted");
                Ok(())
            }
            Outcome::Missing => Err(GatewayError::ThreadNotFound(id)),
            Outcome::Last => Err(GatewayError::LastThread(id)),
        }
    }

    /**
     * \brief Appends a message and bumps the thread's `updated_at`.
     */
    pub fn append_message(
        &self,
        thread_id: i64,
        role: Role,
        content: &str,
        provider: &str,
    ) -> Result<i64, GatewayError> {
        let id = self.write(|tx| insert_message(tx, thread_id, role, content, provider))?;
        id.ok_or(GatewayError::ThreadNotFound(thread_id))
    }

    pub fn attach_source(&self, message_id: i64, kind: SourceKind, title: &str, detail: &str) -> Result<i64> {
        let source = Source::new(kind, title, detail);
        self.write(|tx| insert_source(tx, message_id, &source))
    }

    /**
     * \brief Assistant message plus its sources, in one transaction.
     */
    pub fn append_reply(
        &self,
        thread_id: i64,
        content: &str,
        provider: &str,
        sources: &[Source],
    ) -> Result<i64, GatewayError> {
        let id = self.write(|tx| {
            let Some(id) = insert_message(tx, thread_id, Role::Assistant, content, provider)? else {
                return Ok(None);
            };
            for source in sources {
                insert_source(tx, id, source)?;
            }
            Ok(Some(id))
        })?;
        id.ok_or(GatewayError::ThreadNotFound(thread_id))
    }

    /**
     * \brief Removes one message and its sources; used to roll back an abandoned turn.
     */
    pub fn discard_message(&self, message_id: i64) -> Result<()> {
        self.write(|tx| {
            tx.execute("DELETE FROM message_sources WHERE message_id=?1", params![message_id])?;
            tx.execute("DELETE FROM messages WHERE id=?1", params![message_id])
        })?;
        Ok(())
    }

    /** \brief Messages of a thread in strictly increasing id order. */
    pub fn list_messages(&self, thread_id: i64) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, role, content, provider, created_at
             FROM messages WHERE thread_id=?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![thread_id], |row| {
                let role: String = row.get(2)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    role: Role::parse(&role).unwrap_or(Role::Assistant),
                    content: row.get(3)?,
                    provider: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_sources(&self, message_id: i64) -> Result<Vec<StoredSource>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, message_id, kind, title, detail FROM message_sources
             WHERE message_id=?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![message_id], |row| {
                let kind: String = row.get(2)?;
                Ok(StoredSource {
                    id: row.get(0)?,
                    message_id: row.get(1)?,
                    kind: SourceKind::parse(&kind).unwrap_or(SourceKind::Notice),
                    title: row.get(3)?,
                    detail: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /**
     * \brief Answers every user turn left trailing by a crash with [`INTERRUPTED_REPLY`].
     * \details Only safe before any turn is in flight (startup).
     */
    pub fn heal_dangling_turns(&self, provider: &str) -> Result<usize> {
        let healed = self.write(|tx| {
            let mut stmt = tx.prepare(
                "SELECT m.thread_id FROM messages m
                 WHERE m.id = (SELECT MAX(id) FROM messages WHERE thread_id = m.thread_id)
                   AND m.role = 'user'",
            )?;
            let threads = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            for thread_id in &threads {
                insert_message(tx, *thread_id, Role::Assistant, INTERRUPTED_REPLY, provider)?;
            }
            Ok(threads.len())
        })?;
        if healed > 0 {
            warn!(threads = healed, "answered user turns left unanswered by a previous run");
        }
        Ok(healed)
    }
}

fn insert_thread(tx: &Transaction<'_>, title: &str) -> rusqlite::Result<Thread> {
    let stamp = now_stamp();
    tx.execute(
        "INSERT INTO threads (title, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![title, stamp],
    )?;
    Ok(Thread {
        id: tx.last_insert_rowid(),
        title: title.to_string(),
        created_at: stamp.clone(),
        updated_at: stamp,
    })
}

/** \brief `None` when the thread does not exist. */
fn insert_message(
    tx: &Transaction<'_>,
    thread_id: i64,
    role: Role,
    content: &str,
    provider: &str,
) -> rusqlite::Result<Option<i64>> {
    let stamp = now_stamp();
    let touched = tx.execute(
        "UPDATE threads SET updated_at=?1 WHERE id=?2",
        params![stamp, thread_id],
    )?;
    if touched == 0 {
        return Ok(None);
    }
    tx.execute(
        "INSERT INTO messages (thread_id, role, content, provider, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![thread_id, role.as_str(), content, provider, stamp],
    )?;
    Ok(Some(tx.last_insert_rowid()))
}

fn insert_source(tx: &Transaction<'_>, message_id: i64, source: &Source) -> rusqlite::Result<i64> {
    tx.execute(
        "INSERT INTO message_sources (message_id, kind, title, detail) VALUES (?1, ?2, ?3, ?4)",
        params![message_id, source.kind.as_str(), source.title, source.detail],
    )?;
    Ok(tx.last_insert_rowid())
}

/**
 * \brief Retries on SQLite `busy`/`locked` with linear backoff, at most 6 attempts.
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ThreadStore {
        ThreadStore::in_memory().expect("open in-memory store")
    }

    #[test]
    fn test_resolve_creates_once_then_reuses() {
        let store = store();
        let first = store.resolve_or_create_thread(None).expect("create");
        assert_eq!(first.title, DEFAULT_THREAD_TITLE);
        let again = store.resolve_or_create_thread(None).expect("reuse");
        assert_eq!(again.id, first.id);
        assert_eq!(store.list_threads().expect("list").len(), 1);
    }

    #[test]
    fn test_resolve_unknown_id_fails() {
        let store = store();
        let err = store.resolve_or_create_thread(Some(42)).unwrap_err();
        assert!(matches!(err, GatewayError::ThreadNotFound(42)));
    }

    #[test]
    fn test_resolve_prefers_most_recently_updated() {
        let store = store();
        let a = store.create_thread(Some("a")).expect("a");
        let b = store.create_thread(Some("b")).expect("b");
        std::thread::sleep(Duration::from_millis(5));
        store
            .append_message(a.id, Role::User, "bump", "local")
            .expect("append");
        let current = store.resolve_or_create_thread(None).expect("resolve");
        assert_eq!(current.id, a.id);
        let listed: Vec<i64> = store.list_threads().expect("list").iter().map(|t| t.id).collect();
        assert_eq!(listed, vec![a.id, b.id]);
    }

    #[test]
    fn test_messages_are_ordered_and_attributed() {
        let store = store();
        let thread = store.create_thread(None).expect("thread");
        let u = store
            .append_message(thread.id, Role::User, "hello", "openai")
            .expect("user");
        let a = store
            .append_reply(
                thread.id,
                "hi",
                "local",
                &[Source::new(SourceKind::Notice, "openai unavailable", "HTTP 401")],
            )
            .expect("assistant");
        assert!(a > u);
        let msgs = store.list_messages(thread.id).expect("messages");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].provider, "local");
        let sources = store.list_sources(a).expect("sources");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].kind, SourceKind::Notice);
    }

    #[test]
    fn test_append_to_missing_thread_fails() {
        let store = store();
        let err = store
            .append_message(9, Role::User, "x", "local")
            .unwrap_err();
        assert!(matches!(err, GatewayError::ThreadNotFound(9)));
    }

    #[test]
    fn test_delete_last_thread_is_rejected() {
        let store = store();
        let only = store.create_thread(None).expect("thread");
        let err = store.delete_thread(only.id).unwrap_err();
        assert!(matches!(err, GatewayError::LastThread(id) if id == only.id));
        assert_eq!(store.list_threads().expect("list").len(), 1);
    }

    #[test]
    fn test_delete_cascades_messages_and_sources() {
        let store = store();
        let keep = store.create_thread(Some("keep")).expect("keep");
        let doomed = store.create_thread(Some("doomed")).expect("doomed");
        store
            .append_message(doomed.id, Role::User, "q", "local")
            .expect("user");
        let reply = store.append_reply(doomed.id, "a", "local", &[]).expect("reply");
        store
            .attach_source(reply, SourceKind::Task, "t", "d")
            .expect("source");

        store.delete_thread(doomed.id).expect("delete");
        assert!(store.list_messages(doomed.id).expect("messages").is_empty());
        assert!(store.list_sources(reply).expect("sources").is_empty());
        assert!(matches!(
            store.delete_thread(doomed.id).unwrap_err(),
            GatewayError::ThreadNotFound(_)
        ));
        assert_eq!(store.list_threads().expect("list")[0].id, keep.id);
    }

    #[test]
    fn test_rename_thread() {
        let store = store();
        let t = store.create_thread(None).expect("thread");
        let renamed = store.rename_thread(t.id, "  Bills  ").expect("rename");
        assert_eq!(renamed.title, "Bills");
        assert!(matches!(
            store.rename_thread(t.id, " ").unwrap_err(),
            GatewayError::EmptyTitle
        ));
        assert!(matches!(
            store.rename_thread(t.id + 1, "x").unwrap_err(),
            GatewayError::ThreadNotFound(_)
        ));
    }

    #[test]
    fn test_discard_message_removes_row() {
        let store = store();
        let t = store.create_thread(None).expect("thread");
        let id = store
            .append_message(t.id, Role::User, "draft", "openai")
            .expect("user");
        store.discard_message(id).expect("discard");
        assert!(store.list_messages(t.id).expect("messages").is_empty());
    }

    #[test]
    fn test_heal_dangling_turns_answers_trailing_user_message() {
        let store = store();
        let t = store.create_thread(None).expect("thread");
        store
            .append_message(t.id, Role::User, "lost", "openai")
            .expect("user");
        assert_eq!(store.heal_dangling_turns("local").expect("heal"), 1);
        let msgs = store.list_messages(t.id).expect("messages");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, INTERRUPTED_REPLY);
        assert_eq!(store.heal_dangling_turns("local").expect("heal again"), 0);
    }

    #[test]
    fn test_stamps_sort_lexically() {
        let a = now_stamp();
        std::thread::sleep(Duration::from_millis(2));
        let b = now_stamp();
        assert_eq!(a.len(), b.len());
        assert!(b > a);
    }
}
