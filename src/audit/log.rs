//! The audit store implementation.

use std::net::SocketAddr;
use std::path::Path;

use chrono::Utc;
use log::error;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    EntityTrait, QueryFilter, QueryOrder, Set, Statement, TransactionTrait,
};

use crate::audit::entities::{attempts, blocks, sessions};
use crate::error_handling::types::StorageError;
use crate::geo::GeoRecord;

const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    time TEXT NOT NULL,
    source_ip TEXT NOT NULL,
    source_port INTEGER NOT NULL,
    continent TEXT NOT NULL,
    country TEXT NOT NULL,
    city TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    sandbox TEXT NOT NULL
);
"#;

const CREATE_ATTEMPTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    FOREIGN KEY(session_id) REFERENCES sessions(id)
);
"#;

const CREATE_BLOCKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    delay_ms INTEGER NOT NULL,
    data BLOB NOT NULL,
    FOREIGN KEY(session_id) REFERENCES sessions(id)
);
"#;

/// Append-only persistent record of sessions, credential attempts, and
/// timed byte blocks. One connection, serialized writes.
pub struct AuditLog {
    conn: DatabaseConnection,
}

impl AuditLog {
    /// Opens (or creates) the store at `path` and creates missing tables.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|_| StorageError::ConnectionFailed)?;
            }
        }

        // DSN understood by the sea-orm/sqlx driver; creates the file if needed
        let dsn = format!("sqlite://{}?mode=rwc", path_ref.to_string_lossy());
        let conn = Database::connect(dsn)
            .await
            .map_err(|_| StorageError::ConnectionFailed)?;

        conn.execute(Statement::from_string(
            DbBackend::Sqlite,
            "PRAGMA foreign_keys = ON".to_string(),
        ))
        .await
        .map_err(|_| StorageError::WriteFailed)?;

        for ddl in [
            CREATE_SESSIONS_TABLE,
            CREATE_ATTEMPTS_TABLE,
            CREATE_BLOCKS_TABLE,
        ] {
            conn.execute(Statement::from_string(DbBackend::Sqlite, ddl.to_string()))
                .await
                .map_err(|_| StorageError::WriteFailed)?;
        }

        Ok(Self { conn })
    }

    /// Persists one admitted session and its full list of tried credential
    /// pairs in a single transaction. Returns the new session id.
    ///
    /// The `attempts` column is the length of `tried`, which is exactly the
    /// number of rows inserted into the attempts table.
    pub async fn open_session(
        &self,
        source: SocketAddr,
        geo: &GeoRecord,
        tried: &[(String, String)],
        sandbox: &str,
    ) -> Result<i32, StorageError> {
        let txn = self.conn.begin().await.map_err(|e| {
            error!("audit transaction begin failed: {}", e);
            StorageError::WriteFailed
        })?;

        let session = sessions::ActiveModel {
            time: Set(Utc::now().to_rfc3339()),
            source_ip: Set(source.ip().to_string()),
            source_port: Set(source.port() as i32),
            continent: Set(geo.continent_code.clone()),
            country: Set(geo.country_code.clone()),
            city: Set(geo.city.clone()),
            attempts: Set(tried.len() as i32),
            sandbox: Set(sandbox.to_string()),
            ..Default::default()
        };

        let session_id = sessions::Entity::insert(session)
            .exec(&txn)
            .await
            .map_err(|e| {
                error!("audit session insert failed: {}", e);
                StorageError::WriteFailed
            })?
            .last_insert_id;

        for (username, password) in tried {
            let attempt = attempts::ActiveModel {
                session_id: Set(session_id),
                username: Set(username.clone()),
                password: Set(password.clone()),
                ..Default::default()
            };
            attempt.insert(&txn).await.map_err(|e| {
                error!("audit attempt insert failed: {}", e);
                StorageError::WriteFailed
            })?;
        }

        txn.commit().await.map_err(|e| {
            error!("audit transaction commit failed: {}", e);
            StorageError::WriteFailed
        })?;

        Ok(session_id)
    }

    /// Appends one timed byte block to a session's stream.
    pub async fn append_block(
        &self,
        session_id: i32,
        delay_ms: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let block = blocks::ActiveModel {
            session_id: Set(session_id),
            delay_ms: Set(delay_ms as i64),
            data: Set(data.to_vec()),
            ..Default::default()
        };
        block.insert(&self.conn).await.map_err(|e| {
            error!("audit block insert failed: {}", e);
            StorageError::WriteFailed
        })?;
        Ok(())
    }

    /// The most recently persisted session for `source_ip`, if any.
    pub async fn last_session_for(
        &self,
        source_ip: &str,
    ) -> Result<Option<sessions::Model>, StorageError> {
        sessions::Entity::find()
            .filter(sessions::Column::SourceIp.eq(source_ip))
            .order_by_desc(sessions::Column::Id)
            .one(&self.conn)
            .await
            .map_err(|e| {
                error!("audit session lookup failed: {}", e);
                StorageError::ReadFailed
            })
    }

    /// Session-affinity query: the sandbox handle most recently bound to
    /// `source_ip`, or none if the host has never been admitted.
    pub async fn last_sandbox_for(
        &self,
        source_ip: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self.last_session_for(source_ip).await?.map(|s| s.sandbox))
    }

    /// All credential pairs persisted for a session, in insertion order.
    pub async fn attempts_for(
        &self,
        session_id: i32,
    ) -> Result<Vec<(String, String)>, StorageError> {
        let rows = attempts::Entity::find()
            .filter(attempts::Column::SessionId.eq(session_id))
            .order_by_asc(attempts::Column::Id)
            .all(&self.conn)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
        Ok(rows.into_iter().map(|r| (r.username, r.password)).collect())
    }

    /// All byte blocks persisted for a session, in insertion order.
    pub async fn blocks_for(
        &self,
        session_id: i32,
    ) -> Result<Vec<(i64, Vec<u8>)>, StorageError> {
        let rows = blocks::Entity::find()
            .filter(blocks::Column::SessionId.eq(session_id))
            .order_by_asc(blocks::Column::Id)
            .all(&self.conn)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
        Ok(rows.into_iter().map(|r| (r.delay_ms, r.data)).collect())
    }

    pub async fn close(self) -> Result<(), StorageError> {
        self.conn
            .close()
            .await
            .map_err(|_| StorageError::ConnectionFailed)
    }
}
