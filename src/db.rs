//! SQLite persistence layer for users, videos and comments.
//!
//! A single connection is shared behind a mutex. The handle is cheap to clone
//! and is meant to be created once at startup, handed to the HTTP layer as
//! state, and closed once the server has stopped. Every public method is
//! blocking; async callers should run them on the blocking thread pool.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, ffi, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::ranking::{FeedOrder, recommendation_score};

/// Failures surfaced by store operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("corrupt {column} value: {reason}")]
    Corrupt { column: &'static str, reason: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Registered account. The password hash never leaves the server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub username: String,
    pub followers: Vec<i64>,
    pub following: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    pub caption: String,
    pub likes: i64,
    pub views: i64,
    pub recommendation_score: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: i64,
    pub video_id: i64,
    pub user_id: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        username TEXT NOT NULL,
        followers_json TEXT NOT NULL DEFAULT '[]',
        following_json TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS videos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        caption TEXT NOT NULL DEFAULT '',
        likes INTEGER NOT NULL DEFAULT 0,
        views INTEGER NOT NULL DEFAULT 0,
        recommendation_score REAL NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id)
    );

    CREATE TABLE IF NOT EXISTS comments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        text TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (video_id) REFERENCES videos(id),
        FOREIGN KEY (user_id) REFERENCES users(id)
    );

    CREATE INDEX IF NOT EXISTS idx_videos_created_at ON videos(created_at);
    CREATE INDEX IF NOT EXISTS idx_videos_score ON videos(recommendation_score);
    CREATE INDEX IF NOT EXISTS idx_videos_user_id ON videos(user_id);
    CREATE INDEX IF NOT EXISTS idx_comments_video_id ON comments(video_id);
"#;

const VIDEO_COLUMNS: &str =
    "id, user_id, url, caption, likes, views, recommendation_score, created_at";
const USER_COLUMNS: &str =
    "id, email, password_hash, username, followers_json, following_json, created_at";
const COMMENT_COLUMNS: &str = "id, video_id, user_id, text, created_at";

/// Shared handle to the application database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (and if necessary creates) the database file and its schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("enabling WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting synchronous mode")?;
        debug!(journal_mode = %mode, "database opened");

        let db = Self::from_connection(conn)?;
        info!(path = %path.display(), "database ready");
        Ok(db)
    }

    /// Private database living only as long as the handle; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enabling foreign keys")?;
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA).context("creating schema")?;
        tx.commit()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Closes the underlying connection once the last handle is released.
    /// Handles still held elsewhere keep the connection alive.
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.conn) {
            Ok(mutex) => {
                mutex
                    .into_inner()
                    .close()
                    .map_err(|(_, err)| err)
                    .context("closing database")?;
                info!("database closed");
            }
            Err(_) => debug!("database still shared; leaving connection open"),
        }
        Ok(())
    }

    pub fn create_user(&self, email: &str, password_hash: &str, username: &str) -> DbResult<User> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO users (email, password_hash, username, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![email, password_hash, username, now_millis()],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                return Err(DbError::Conflict("email"));
            }
            Err(err) => return Err(err.into()),
        }
        let id = conn.last_insert_rowid();
        fetch_user(&conn, id)?.ok_or(DbError::NotFound("user"))
    }

    pub fn find_user_by_email(&self, email: &str) -> DbResult<Option<User>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"))?;
        let mut rows = stmt.query([email])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_user(row)?)),
            None => Ok(None),
        }
    }

    pub fn find_user_by_id(&self, id: i64) -> DbResult<Option<User>> {
        fetch_user(&self.conn.lock(), id)
    }

    /// Records a fresh upload. Counters and score start at zero.
    pub fn create_video(&self, owner_id: i64, url: &str, caption: &str) -> DbResult<Video> {
        let conn = self.conn.lock();
        if !exists(&conn, "users", owner_id)? {
            return Err(DbError::NotFound("user"));
        }
        conn.execute(
            "INSERT INTO videos (user_id, url, caption, likes, views, recommendation_score, created_at)
             VALUES (?1, ?2, ?3, 0, 0, ?4, ?5)",
            params![
                owner_id,
                url,
                caption,
                recommendation_score(0, 0),
                now_millis()
            ],
        )?;
        let id = conn.last_insert_rowid();
        fetch_video(&conn, id)?.ok_or(DbError::NotFound("video"))
    }

    pub fn list_videos(&self, order: FeedOrder, limit: Option<usize>) -> DbResult<Vec<Video>> {
        let conn = self.conn.lock();
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT {VIDEO_COLUMNS} FROM videos ORDER BY {} LIMIT ?1",
            order.order_by()
        ))?;
        let mut rows = stmt.query([limit])?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next()? {
            videos.push(row_to_video(row)?);
        }
        Ok(videos)
    }

    pub fn get_video(&self, id: i64) -> DbResult<Option<Video>> {
        fetch_video(&self.conn.lock(), id)
    }

    /// Adds one like and persists the recomputed score.
    ///
    /// Read, recompute and write happen inside one immediate transaction while
    /// the connection lock is held, so concurrent likes are never lost.
    pub fn increment_like(&self, video_id: i64) -> DbResult<Video> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let counters: Option<(i64, i64)> = tx
            .query_row(
                "SELECT likes, views FROM videos WHERE id = ?1",
                [video_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (likes, views) = counters.ok_or(DbError::NotFound("video"))?;

        let likes = likes + 1;
        tx.execute(
            "UPDATE videos SET likes = ?1, recommendation_score = ?2 WHERE id = ?3",
            params![likes, recommendation_score(likes, views), video_id],
        )?;
        let video = fetch_video(&tx, video_id)?.ok_or(DbError::NotFound("video"))?;
        tx.commit()?;
        Ok(video)
    }

    pub fn list_comments_for_video(&self, video_id: i64) -> DbResult<Vec<Comment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMENT_COLUMNS} FROM comments
             WHERE video_id = ?1
             ORDER BY created_at DESC, id DESC"
        ))?;
        let mut rows = stmt.query([video_id])?;
        let mut comments = Vec::new();
        while let Some(row) = rows.next()? {
            comments.push(row_to_comment(row)?);
        }
        Ok(comments)
    }

    pub fn create_comment(&self, video_id: i64, author_id: i64, text: &str) -> DbResult<Comment> {
        let conn = self.conn.lock();
        if !exists(&conn, "videos", video_id)? {
            return Err(DbError::NotFound("video"));
        }
        if !exists(&conn, "users", author_id)? {
            return Err(DbError::NotFound("user"));
        }
        conn.execute(
            "INSERT INTO comments (video_id, user_id, text, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![video_id, author_id, text, now_millis()],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt =
            conn.prepare(&format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE id = ?1"))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => row_to_comment(row),
            None => Err(DbError::NotFound("comment")),
        }
    }

    pub fn list_videos_by_user(&self, user_id: i64) -> DbResult<Vec<Video>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {VIDEO_COLUMNS} FROM videos WHERE user_id = ?1 ORDER BY {}",
            FeedOrder::Newest.order_by()
        ))?;
        let mut rows = stmt.query([user_id])?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next()? {
            videos.push(row_to_video(row)?);
        }
        Ok(videos)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn exists(conn: &Connection, table: &str, id: i64) -> DbResult<bool> {
    let found = conn
        .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), [id], |_| {
            Ok(())
        })
        .optional()?;
    Ok(found.is_some())
}

fn fetch_user(conn: &Connection, id: i64) -> DbResult<Option<User>> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_user(row)?)),
        None => Ok(None),
    }
}

fn fetch_video(conn: &Connection, id: i64) -> DbResult<Option<Video>> {
    let mut stmt = conn.prepare(&format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?1"))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_video(row)?)),
        None => Ok(None),
    }
}

fn timestamp(row: &Row<'_>, column: &'static str) -> DbResult<DateTime<Utc>> {
    let millis: i64 = row.get(column)?;
    DateTime::from_timestamp_millis(millis).ok_or_else(|| DbError::Corrupt {
        column,
        reason: format!("{millis} is out of range"),
    })
}

fn id_list(row: &Row<'_>, column: &'static str) -> DbResult<Vec<i64>> {
    let json: String = row.get(column)?;
    serde_json::from_str(&json).map_err(|err| DbError::Corrupt {
        column,
        reason: err.to_string(),
    })
}

fn row_to_user(row: &Row<'_>) -> DbResult<User> {
    Ok(User {
        id: row.get("id")?,
        email: row.get("email")?,
        password_hash: row.get("password_hash")?,
        username: row.get("username")?,
        followers: id_list(row, "followers_json")?,
        following: id_list(row, "following_json")?,
        created_at: timestamp(row, "created_at")?,
    })
}

fn row_to_video(row: &Row<'_>) -> DbResult<Video> {
    Ok(Video {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        url: row.get("url")?,
        caption: row.get("caption")?,
        likes: row.get("likes")?,
        views: row.get("views")?,
        recommendation_score: row.get("recommendation_score")?,
        timestamp: timestamp(row, "created_at")?,
    })
}

fn row_to_comment(row: &Row<'_>) -> DbResult<Comment> {
    Ok(Comment {
        id: row.get("id")?,
        video_id: row.get("video_id")?,
        user_id: row.get("user_id")?,
        text: row.get("text")?,
        timestamp: timestamp(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded() -> (Database, User) {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user("a@x.com", "hash", "a").unwrap();
        (db, user)
    }

    #[test]
    fn open_creates_parent_directories_and_reopens() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("reeltube.db");
        let db = Database::open(&path)?;
        db.create_user("a@x.com", "hash", "a")?;
        db.close()?;

        let reopened = Database::open(&path)?;
        assert!(reopened.find_user_by_email("a@x.com")?.is_some());
        Ok(())
    }

    #[test]
    fn duplicate_email_is_a_conflict() {
        let (db, _) = seeded();
        let err = db.create_user("a@x.com", "other", "b").unwrap_err();
        assert!(matches!(err, DbError::Conflict("email")));
    }

    #[test]
    fn users_start_without_followers() {
        let (db, user) = seeded();
        let found = db.find_user_by_id(user.id).unwrap().unwrap();
        assert_eq!(found.email, "a@x.com");
        assert!(found.followers.is_empty());
        assert!(found.following.is_empty());
        assert!(db.find_user_by_id(user.id + 100).unwrap().is_none());
        assert!(db.find_user_by_email("nobody@x.com").unwrap().is_none());
    }

    #[test]
    fn new_video_has_zeroed_counters() {
        let (db, user) = seeded();
        let video = db.create_video(user.id, "/uploads/1.mp4", "hello").unwrap();
        assert_eq!(video.user_id, user.id);
        assert_eq!(video.likes, 0);
        assert_eq!(video.views, 0);
        assert_eq!(video.recommendation_score, 0.0);
    }

    #[test]
    fn video_owner_must_exist() {
        let (db, user) = seeded();
        let err = db.create_video(user.id + 1, "/uploads/x.mp4", "").unwrap_err();
        assert!(matches!(err, DbError::NotFound("user")));
    }

    #[test]
    fn likes_recompute_the_score() {
        let (db, user) = seeded();
        let video = db.create_video(user.id, "/uploads/1.mp4", "").unwrap();
        let once = db.increment_like(video.id).unwrap();
        assert_eq!((once.likes, once.recommendation_score), (1, 1.0));
        let twice = db.increment_like(video.id).unwrap();
        assert_eq!((twice.likes, twice.recommendation_score), (2, 2.0));
    }

    #[test]
    fn liking_missing_video_is_not_found() {
        let (db, _) = seeded();
        assert!(matches!(
            db.increment_like(42).unwrap_err(),
            DbError::NotFound("video")
        ));
    }

    #[test]
    fn concurrent_likes_are_not_lost() {
        let (db, user) = seeded();
        let video = db.create_video(user.id, "/uploads/1.mp4", "").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        db.increment_like(video.id).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let video = db.get_video(video.id).unwrap().unwrap();
        assert_eq!(video.likes, 200);
        assert_eq!(video.recommendation_score, 200.0);
    }

    #[test]
    fn feeds_use_independent_orderings() {
        let (db, user) = seeded();
        let first = db.create_video(user.id, "/uploads/1.mp4", "first").unwrap();
        let second = db.create_video(user.id, "/uploads/2.mp4", "second").unwrap();
        let third = db.create_video(user.id, "/uploads/3.mp4", "third").unwrap();
        db.increment_like(first.id).unwrap();
        db.increment_like(first.id).unwrap();
        db.increment_like(third.id).unwrap();

        let newest: Vec<i64> = db
            .list_videos(FeedOrder::Newest, None)
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(newest, vec![third.id, second.id, first.id]);

        let ranked: Vec<i64> = db
            .list_videos(FeedOrder::Recommended, None)
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ranked, vec![first.id, third.id, second.id]);

        let limited = db.list_videos(FeedOrder::Recommended, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn score_ties_keep_insertion_order() {
        let (db, user) = seeded();
        let ids: Vec<i64> = (0..4)
            .map(|n| {
                db.create_video(user.id, &format!("/uploads/{n}.mp4"), "")
                    .unwrap()
                    .id
            })
            .collect();
        let ranked: Vec<i64> = db
            .list_videos(FeedOrder::Recommended, None)
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ranked, ids);
    }

    #[test]
    fn comments_are_listed_newest_first() {
        let (db, user) = seeded();
        let video = db.create_video(user.id, "/uploads/1.mp4", "").unwrap();
        let a = db.create_comment(video.id, user.id, "first").unwrap();
        let b = db.create_comment(video.id, user.id, "second").unwrap();
        assert_eq!(b.text, "second");

        let listed: Vec<i64> = db
            .list_comments_for_video(video.id)
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(listed, vec![b.id, a.id]);
        assert!(db.list_comments_for_video(video.id + 1).unwrap().is_empty());
    }

    #[test]
    fn comment_on_missing_video_is_not_found() {
        let (db, user) = seeded();
        assert!(matches!(
            db.create_comment(7, user.id, "hi").unwrap_err(),
            DbError::NotFound("video")
        ));
    }

    #[test]
    fn videos_by_user_only_returns_their_uploads() {
        let (db, alice) = seeded();
        let bob = db.create_user("b@x.com", "hash", "b").unwrap();
        db.create_video(alice.id, "/uploads/a.mp4", "").unwrap();
        db.create_video(bob.id, "/uploads/b.mp4", "").unwrap();

        let videos = db.list_videos_by_user(bob.id).unwrap();
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].user_id, bob.id);
    }

    #[test]
    fn password_hash_is_not_serialized() {
        let (_, user) = seeded();
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("passwordHash").is_none());
        assert_eq!(json["username"], "a");
    }
}
