//! SQLite-based persistence for peers, users and login sessions

use std::path::Path;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use rusqlite::{Connection, params, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::{self, Authenticator};
use crate::models::{LoginLog, PeerRecord, SysInfo, User, UserStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Background task failed: {0}")]
    Task(String),
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Password hashing failed: {0}")]
    Hash(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable peer records.
///
/// `save` only writes presence (`last_online_time`, `last_online_ip`);
/// `register_peer` owns everything else about a peer row.
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<PeerRecord>, StoreError>;
    async fn save(&self, peer: &PeerRecord) -> Result<(), StoreError>;
    /// Create the peer row or refresh its system information
    async fn register_peer(&self, info: &SysInfo) -> Result<PeerRecord, StoreError>;
}

/// In-memory store for testing
#[cfg(test)]
pub struct MemoryStore {
    peers: Mutex<std::collections::HashMap<String, PeerRecord>>,
    fail_saves: std::sync::atomic::AtomicBool,
    fail_finds: std::sync::atomic::AtomicBool,
    saves: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(std::collections::HashMap::new()),
            fail_saves: std::sync::atomic::AtomicBool::new(false),
            fail_finds: std::sync::atomic::AtomicBool::new(false),
            saves: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Store pre-seeded with one registered peer per uuid
    pub fn with_peers(uuids: &[&str]) -> Self {
        let store = Self::new();
        for (i, uuid) in uuids.iter().enumerate() {
            store.insert(PeerRecord::new(i as i64 + 1, *uuid));
        }
        store
    }

    pub fn insert(&self, peer: PeerRecord) {
        self.peers.lock().unwrap().insert(peer.uuid.clone(), peer);
    }

    pub fn get(&self, uuid: &str) -> Option<PeerRecord> {
        self.peers.lock().unwrap().get(uuid).cloned()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_fail_finds(&self, fail: bool) {
        self.fail_finds.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl PeerStore for MemoryStore {
    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<PeerRecord>, StoreError> {
        if self.fail_finds.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Unavailable("find disabled".to_string()));
        }
        Ok(self.get(uuid))
    }

    async fn save(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Unavailable("save disabled".to_string()));
        }
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.insert(peer.clone());
        Ok(())
    }

    async fn register_peer(&self, info: &SysInfo) -> Result<PeerRecord, StoreError> {
        let mut peers = self.peers.lock().unwrap();
        let next_row = peers.len() as i64 + 1;
        let peer = peers
            .entry(info.uuid.clone())
            .or_insert_with(|| PeerRecord::new(next_row, info.uuid.clone()));
        peer.device_id = info.id.clone();
        peer.hostname = info.hostname.clone();
        Ok(peer.clone())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS peers (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    device_id TEXT NOT NULL DEFAULT '',
    hostname TEXT NOT NULL DEFAULT '',
    os TEXT NOT NULL DEFAULT '',
    username TEXT NOT NULL DEFAULT '',
    client_version TEXT NOT NULL DEFAULT '',
    last_online_time INTEGER NOT NULL DEFAULT 0,
    last_online_ip TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    nickname TEXT NOT NULL DEFAULT '',
    email TEXT NOT NULL DEFAULT '',
    is_admin INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    token TEXT NOT NULL UNIQUE,
    device_uuid TEXT NOT NULL DEFAULT '',
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_tokens_user ON user_tokens (user_id);

CREATE TABLE IF NOT EXISTS login_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    client TEXT NOT NULL DEFAULT '',
    device_id TEXT NOT NULL DEFAULT '',
    uuid TEXT NOT NULL DEFAULT '',
    ip TEXT NOT NULL DEFAULT '',
    login_type TEXT NOT NULL DEFAULT '',
    platform TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);
"#;

const PEER_COLUMNS: &str = "row_id, uuid, device_id, hostname, last_online_time, last_online_ip";
const USER_COLUMNS: &str = "id, username, nickname, email, is_admin, status";

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn peer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerRecord> {
    Ok(PeerRecord {
        row_id: row.get(0)?,
        uuid: row.get(1)?,
        device_id: row.get(2)?,
        hostname: row.get(3)?,
        last_online_time: row.get::<_, i64>(4)?.max(0) as u64,
        last_online_ip: row.get(5)?,
        version: 0,
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        nickname: row.get(2)?,
        email: row.get(3)?,
        is_admin: row.get::<_, i64>(4)? != 0,
        status: UserStatus::from_i64(row.get(5)?),
    })
}

/// SQLite-based store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    pub async fn create_user(&self, username: &str, password: &str, is_admin: bool) -> Result<User, StoreError> {
        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO users (username, password_hash, nickname, is_admin, status, created_at)
                VALUES (?1, ?2, ?1, ?3, ?4, ?5)
                "#,
                params![username, password_hash, is_admin as i64, UserStatus::Enabled.as_i64(), unix_now()],
            )?;
            let id = conn.last_insert_rowid();
            let user = conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )?;
            Ok(user)
        })
        .await
    }

    pub async fn set_user_status(&self, user_id: i64, status: UserStatus) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE users SET status = ?1 WHERE id = ?2",
                params![status.as_i64(), user_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn count_users(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// First-run setup: create the `admin` account if there are no users yet.
    /// Returns whether an account was created.
    pub async fn bootstrap_admin(&self, password: &str) -> Result<bool, StoreError> {
        if self.count_users().await? > 0 {
            return Ok(false);
        }
        self.create_user("admin", password, true).await?;
        info!("Created initial admin account");
        Ok(true)
    }
}

#[async_trait]
impl PeerStore for SqliteStore {
    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<PeerRecord>, StoreError> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| {
            let peer = conn
                .query_row(
                    &format!("SELECT {PEER_COLUMNS} FROM peers WHERE uuid = ?1"),
                    params![uuid],
                    peer_from_row,
                )
                .optional()?;
            Ok(peer)
        })
        .await
    }

    async fn save(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        let peer = peer.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                r#"
                UPDATE peers
                SET last_online_time = ?1, last_online_ip = ?2, updated_at = ?3
                WHERE row_id = ?4
                "#,
                params![peer.last_online_time as i64, peer.last_online_ip, unix_now(), peer.row_id],
            )?;
            // A row deleted by an operator since the heartbeat leaves nothing to update.
            if updated == 0 {
                debug!("Peer {} (row {}) no longer exists, presence discarded", peer.uuid, peer.row_id);
            }
            Ok(())
        })
        .await
    }

    // Presence columns are left alone; they belong to the presence cache.
    async fn register_peer(&self, info: &SysInfo) -> Result<PeerRecord, StoreError> {
        let info = info.clone();
        self.with_conn(move |conn| {
            let now = unix_now();
            conn.execute(
                r#"
                INSERT INTO peers (uuid, device_id, hostname, os, username, client_version, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                ON CONFLICT(uuid) DO UPDATE SET
                    device_id = excluded.device_id,
                    hostname = excluded.hostname,
                    os = excluded.os,
                    username = excluded.username,
                    client_version = excluded.client_version,
                    updated_at = excluded.updated_at
                "#,
                params![info.uuid, info.id, info.hostname, info.os, info.username, info.version, now],
            )?;
            let peer = conn.query_row(
                &format!("SELECT {PEER_COLUMNS} FROM peers WHERE uuid = ?1"),
                params![info.uuid],
                peer_from_row,
            )?;
            Ok(peer)
        })
        .await
    }
}

#[async_trait]
impl Authenticator for SqliteStore {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>, StoreError> {
        let username = username.to_string();
        let row = self
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE username = ?1"),
                        params![username],
                        |row| Ok((user_from_row(row)?, row.get::<_, String>(6)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        let Some((user, hash)) = row else {
            return Ok(None);
        };

        // Hashing is slow; the connection must be free while it runs.
        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
        Ok(verified.then_some(user))
    }

    async fn issue_token(&self, user: &User, log: &LoginLog, expires_at: u64) -> Result<String, StoreError> {
        let token = Uuid::new_v4().simple().to_string();
        let user_id = user.id;
        let log = log.clone();
        let issued = token.clone();
        self.with_conn(move |conn| {
            let now = unix_now();
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO user_tokens (user_id, token, device_uuid, expires_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![user_id, issued, log.uuid, expires_at as i64, now],
            )?;
            tx.execute(
                r#"
                INSERT INTO login_logs (user_id, client, device_id, uuid, ip, login_type, platform, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![user_id, log.client, log.device_id, log.uuid, log.ip, log.login_type, log.platform, now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(token)
    }

    async fn revoke_token(&self, token: &str, now: u64) -> Result<bool, StoreError> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM user_tokens WHERE token = ?1 AND expires_at > ?2",
                params![token, now as i64],
            )?;
            Ok(deleted > 0)
        })
        .await
    }
}
