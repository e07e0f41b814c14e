use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;

use super::cipher::{FieldCipher, SEPARATOR};
use super::query::{self, Predicate, QueryFilter, QueryOptions, Statement};
use super::{sql_to_json, Record, Result, StoreError};
use crate::serial::decoder::parse_number;

pub const IN_MEMORY: &str = ":memory:";

/// Which stored values `select` tries to decrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptPolicy {
    /// Only the listed columns of each table
    Declared(BTreeMap<String, BTreeSet<String>>),
    /// Any string value containing the separator, in any column
    Opportunistic,
}

impl Default for DecryptPolicy {
    fn default() -> Self {
        DecryptPolicy::Declared(BTreeMap::new())
    }
}

impl DecryptPolicy {
    pub fn declared<I, C>(table: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let mut tables = BTreeMap::new();
        tables.insert(table.to_string(), columns.into_iter().map(Into::into).collect());
        DecryptPolicy::Declared(tables)
    }

    pub fn covers(&self, table: &str, column: &str) -> bool {
        match self {
            DecryptPolicy::Opportunistic => true,
            DecryptPolicy::Declared(tables) => tables
                .get(table)
                .is_some_and(|columns| columns.contains(column)),
        }
    }
}

/// SQLite handle shared by the pipeline, the command surface and the HTTP
/// ingress. rusqlite::Connection is !Sync, so it sits behind a Mutex and every
/// statement runs on the blocking pool.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Option<Connection>>>,
    cipher: Arc<FieldCipher>,
    policy: Arc<DecryptPolicy>,
}

impl Database {
    /// Open a database file, or an in-memory one for `:memory:`.
    pub fn open(path: &str, cipher: Arc<FieldCipher>, policy: DecryptPolicy) -> Result<Self> {
        let conn = if path == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(path)?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            conn
        };
        log::info!("Storage opened at {}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            cipher,
            policy: Arc::new(policy),
        })
    }

    pub fn open_in_memory(cipher: Arc<FieldCipher>, policy: DecryptPolicy) -> Result<Self> {
        Self::open(IN_MEMORY, cipher, policy)
    }

    pub fn policy(&self) -> &DecryptPolicy {
        &self.policy
    }

    /// Run plain SQL such as a bootstrap schema. No parameters.
    pub async fn execute_batch(&self, sql: impl Into<String>) -> Result<()> {
        let sql = sql.into();
        self.with_conn(move |conn| Ok(conn.execute_batch(&sql)?)).await
    }

    pub async fn apply_schema_file(&self, path: &Path) -> Result<()> {
        let sql = tokio::fs::read_to_string(path).await?;
        self.execute_batch(sql).await?;
        log::info!("Applied schema from {}", path.display());
        Ok(())
    }

    /// Insert one record, returning the new rowid.
    pub async fn insert(&self, table: &str, record: &Record) -> Result<i64> {
        let stmt = query::build_insert(table, record)?;
        log::debug!("{}", stmt.sql);
        self.with_conn(move |conn| {
            conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn update(&self, table: &str, record: &Record, predicates: &[Predicate]) -> Result<usize> {
        let stmt = query::build_update(table, record, predicates)?;
        self.execute(stmt).await
    }

    pub async fn delete(&self, table: &str, predicates: &[Predicate]) -> Result<usize> {
        let stmt = query::build_delete(table, predicates)?;
        self.execute(stmt).await
    }

    /// Rows matching every filter, with covered columns decrypted.
    pub async fn select(&self, table: &str, filters: &QueryFilter, options: &QueryOptions) -> Result<Vec<Record>> {
        let stmt = query::build_select(table, filters, options)?;
        log::debug!("{}", stmt.sql);
        let rows = self
            .with_conn(move |conn| {
                let mut prepared = conn.prepare(&stmt.sql)?;
                let columns: Vec<String> = prepared.column_names().into_iter().map(String::from).collect();
                let mut rows = prepared.query(params_from_iter(stmt.params.iter()))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut record = Record::new();
                    for (idx, name) in columns.iter().enumerate() {
                        let value: SqlValue = row.get(idx)?;
                        record.insert(name.clone(), sql_to_json(value));
                    }
                    out.push(record);
                }
                Ok(out)
            })
            .await?;

        Ok(rows.into_iter().map(|row| self.decrypt_row(table, row)).collect())
    }

    /// `SELECT 1` round trip
    pub async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    pub fn is_open(&self) -> bool {
        match self.conn.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Drop the connection. Safe to call more than once.
    pub fn close(&self) {
        let mut guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            log::info!("Storage connection closed");
        }
    }

    fn decrypt_row(&self, table: &str, mut row: Record) -> Record {
        for (column, value) in row.iter_mut() {
            let Value::String(stored) = value else { continue };
            if !stored.contains(SEPARATOR) || !self.policy.covers(table, column) {
                continue;
            }
            let plain = self.cipher.decrypt(stored);
            if plain == *stored {
                continue;
            }
            *value = match parse_number(&plain) {
                Some(n) => Value::Number(n),
                None => Value::String(plain),
            };
        }
        row
    }

    async fn execute(&self, stmt: Statement) -> Result<usize> {
        log::debug!("{}", stmt.sql);
        self.with_conn(move |conn| Ok(conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?))
            .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("open", &self.is_open())
            .field("policy", &self.policy)
            .finish()
    }
}
