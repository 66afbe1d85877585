//! Single-connection gateway to the target store.
//!
//! The connection never runs in autocommit mode: a transaction is opened on
//! connect and re-opened after every commit or rollback, so each statement
//! belongs to the unit of work that the next `commit`/`rollback` ends.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Duration, Local, NaiveDateTime, Timelike};
use rand::Rng;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection};
use tracing::{debug, info, warn};

use crate::dialect::to_sqlite;
use crate::error::StoreError;
use crate::format::{bracket, format_date, format_int, parse_stored_date};
use crate::schema::{self, TABLE_MPDPHASE, TABLE_TASKTYPE, primary_key};

/// Upper bound on random probes before identifier allocation gives up.
pub const MAX_ID_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Date,
    String,
    Bool,
    Currency,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Int(i64),
    Date(NaiveDateTime),
    String(String),
    Bool(bool),
    Currency(Decimal),
}

impl DbValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Fully fetched result of a row query.
pub struct QueryRows {
    rows: Vec<SqliteRow>,
}

impl QueryRows {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Nullable integer column of the given row.
    pub fn get_int(&self, row: usize, column: &str) -> Result<Option<i64>, StoreError> {
        let row = self
            .rows
            .get(row)
            .ok_or_else(|| StoreError::Query(format!("row {} out of range", row)))?;
        Ok(row.try_get_unchecked::<Option<i64>, _>(column)?)
    }

    pub fn get_string(&self, row: usize, column: &str) -> Result<Option<String>, StoreError> {
        let row = self
            .rows
            .get(row)
            .ok_or_else(|| StoreError::Query(format!("row {} out of range", row)))?;
        Ok(row.try_get_unchecked::<Option<String>, _>(column)?)
    }
}

pub struct DatabaseGateway {
    conn: Option<SqliteConnection>,
    path: Option<PathBuf>,
    commit_enabled: bool,
}

impl Default for DatabaseGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseGateway {
    pub fn new() -> Self {
        Self {
            conn: None,
            path: None,
            commit_enabled: true,
        }
    }

    /// Opens an existing store file. Any previous connection is closed first.
    pub async fn connect(&mut self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        self.open(path.as_ref(), false).await?;
        info!(path = %path.as_ref().display(), "Target store opened");
        Ok(())
    }

    /// Creates a new store file and installs the target tables.
    pub async fn create(&mut self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(StoreError::Connection {
                path: path.to_path_buf(),
                reason: "file already exists".to_string(),
            });
        }
        self.open(path, true).await?;
        schema::create_tables(self).await?;
        info!(path = %path.display(), "Target store created");
        Ok(())
    }

    async fn open(&mut self, path: &Path, create: bool) -> Result<(), StoreError> {
        self.disconnect().await;
        let connection_error = |err: sqlx::Error| StoreError::Connection {
            path: path.to_path_buf(),
            reason: err.to_string(),
        };
        let mut conn = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .connect()
            .await
            .map_err(connection_error)?;
        sqlx::query("BEGIN")
            .execute(&mut conn)
            .await
            .map_err(connection_error)?;
        self.conn = Some(conn);
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    /// Discards uncommitted work and closes the connection. Never fails.
    pub async fn disconnect(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if let Err(err) = sqlx::query("ROLLBACK").execute(&mut conn).await {
            debug!("rollback on disconnect failed: {}", err);
        }
        if let Err(err) = conn.close().await {
            warn!("closing target store failed: {}", err);
        }
        if let Some(path) = self.path.take() {
            info!(path = %path.display(), "Target store closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// When disabled, `commit` rolls back instead. Used for dry runs.
    pub fn set_commit_enabled(&mut self, enabled: bool) {
        self.commit_enabled = enabled;
    }

    pub fn commit_enabled(&self) -> bool {
        self.commit_enabled
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::NotConnected)
    }

    /// Runs a write statement and returns the number of affected rows.
    pub async fn execute(&mut self, sql: &str) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        debug!(sql, "execute");
        let result = sqlx::query(&to_sqlite(sql))
            .execute(&mut *conn)
            .await
            .map_err(|err| StoreError::Write(format!("{} ({})", err, sql)))?;
        Ok(result.rows_affected())
    }

    pub async fn query(&mut self, sql: &str) -> Result<QueryRows, StoreError> {
        let conn = self.conn()?;
        debug!(sql, "query");
        let rows = sqlx::query(&to_sqlite(sql))
            .fetch_all(&mut *conn)
            .await
            .map_err(|err| StoreError::Query(format!("{} ({})", err, sql)))?;
        Ok(QueryRows { rows })
    }

    pub fn row_count(rows: &QueryRows) -> usize {
        rows.row_count()
    }

    /// First column of the single row `sql` yields, coerced to `expected`.
    ///
    /// Returns `None` when either argument is missing, when no row matches,
    /// or when the value is NULL. More than one row is an error.
    pub async fn query_one(
        &mut self,
        sql: Option<&str>,
        expected: Option<ValueType>,
    ) -> Result<Option<DbValue>, StoreError> {
        self.conn()?;
        let (Some(sql), Some(expected)) = (sql, expected) else {
            return Ok(None);
        };
        let rows = self.query(sql).await?;
        match rows.rows.as_slice() {
            [] => Ok(None),
            [row] => decode_first_column(row, expected),
            many => Err(StoreError::AmbiguousResult {
                sql: sql.to_string(),
                rows: many.len(),
            }),
        }
    }

    pub async fn query_one_int(&mut self, sql: Option<&str>) -> Result<Option<i64>, StoreError> {
        let value = self.query_one(sql, Some(ValueType::Int)).await?;
        Ok(value.and_then(|v| v.as_int()))
    }

    pub async fn query_one_date(
        &mut self,
        sql: Option<&str>,
    ) -> Result<Option<NaiveDateTime>, StoreError> {
        let value = self.query_one(sql, Some(ValueType::Date)).await?;
        Ok(value.and_then(|v| v.as_date()))
    }

    pub async fn query_one_string(
        &mut self,
        sql: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let value = self.query_one(sql, Some(ValueType::String)).await?;
        Ok(value.and_then(|v| match v {
            DbValue::String(s) => Some(s),
            _ => None,
        }))
    }

    /// `[Description]` of the row keyed by `id` in a lookup table.
    pub async fn description(&mut self, table: &str, id: i64) -> Result<Option<String>, StoreError> {
        let key = primary_key(table);
        let sql = format!(
            "SELECT [Description] FROM {} WHERE {} = {}",
            bracket(table),
            bracket(&key),
            format_int(Some(id))
        );
        self.query_one_string(Some(&sql)).await
    }

    pub async fn task_type_description(&mut self, id: i64) -> Result<Option<String>, StoreError> {
        self.description(TABLE_TASKTYPE, id).await
    }

    pub async fn mpd_phase_description(&mut self, id: i64) -> Result<Option<String>, StoreError> {
        self.description(TABLE_MPDPHASE, id).await
    }

    /// Returns an identifier not currently used as `table`'s primary key.
    ///
    /// Candidates are drawn at random from the 32-bit range; negative values
    /// are only produced when `positive_only` is false.
    pub async fn allocate_id(&mut self, table: &str, positive_only: bool) -> Result<i64, StoreError> {
        self.conn()?;
        let key = primary_key(table);
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let candidate = random_candidate(positive_only);
            let sql = format!(
                "SELECT {} FROM {} WHERE {} = {}",
                bracket(&key),
                bracket(table),
                bracket(&key),
                format_int(Some(candidate))
            );
            let rows = self
                .query(&sql)
                .await
                .map_err(|err| StoreError::Write(err.to_string()))?;
            if rows.is_empty() {
                debug!(table, id = candidate, attempt, "allocated id");
                return Ok(candidate);
            }
        }
        Err(StoreError::Write(format!(
            "no free identifier found in {} after {} attempts",
            table, MAX_ID_ATTEMPTS
        )))
    }

    /// Stamps the row's `[LastEdit]` with the current time.
    ///
    /// The stored value only has second resolution, so a row edited twice in
    /// the same second is moved one second past its previous stamp.
    pub async fn touch_last_edit(&mut self, table: &str, id: i64) -> Result<(), StoreError> {
        let key = primary_key(table);
        let select = format!(
            "SELECT [LastEdit] FROM {} WHERE {} = {}",
            bracket(table),
            bracket(&key),
            format_int(Some(id))
        );
        let previous = self.query_one_date(Some(&select)).await?;
        let now = Local::now().naive_local();
        let now = now.with_nanosecond(0).unwrap_or(now);
        let stamp = match previous {
            Some(prev) if prev >= now => prev + Duration::seconds(1),
            _ => now,
        };
        let update = format!(
            "UPDATE {} SET [LastEdit] = {} WHERE {} = {}",
            bracket(table),
            format_date(Some(stamp), true),
            bracket(&key),
            format_int(Some(id))
        );
        if self.execute(&update).await? == 0 {
            return Err(StoreError::Write(format!("{} {} does not exist", table, id)));
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), StoreError> {
        if !self.commit_enabled {
            debug!("commit disabled, rolling back instead");
            return self.rollback().await;
        }
        self.end_transaction("COMMIT").await
    }

    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        self.end_transaction("ROLLBACK").await
    }

    /// Ends the open transaction and always opens the next one, so the
    /// connection never falls back to autocommit.
    async fn end_transaction(&mut self, statement: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let ended = match sqlx::query(statement).execute(&mut *conn).await {
            Ok(_) => Ok(()),
            // A trigger or an I/O error can end the transaction inside SQLite.
            Err(err) if statement == "ROLLBACK" && no_active_transaction(&err) => {
                debug!("transaction was already rolled back by the store");
                Ok(())
            }
            Err(err) => {
                if statement == "COMMIT" {
                    if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                        debug!("rollback after failed commit: {}", rollback_err);
                    }
                }
                Err(StoreError::Write(format!("{} failed: {}", statement, err)))
            }
        };
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|err| StoreError::Write(format!("BEGIN failed: {}", err)))?;
        ended
    }
}

fn no_active_transaction(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.message().contains("no transaction is active"))
}

fn random_candidate(positive_only: bool) -> i64 {
    let mut rng = rand::thread_rng();
    if positive_only {
        rng.gen_range(1..=i32::MAX as i64)
    } else {
        rng.gen_range(i32::MIN as i64..=i32::MAX as i64)
    }
}

fn decode_first_column(row: &SqliteRow, expected: ValueType) -> Result<Option<DbValue>, StoreError> {
    let value = match expected {
        ValueType::Int => row.try_get_unchecked::<Option<i64>, _>(0)?.map(DbValue::Int),
        ValueType::Bool => row
            .try_get_unchecked::<Option<i64>, _>(0)?
            .map(|v| DbValue::Bool(v != 0)),
        ValueType::String => row
            .try_get_unchecked::<Option<String>, _>(0)?
            .map(DbValue::String),
        ValueType::Date => match row.try_get_unchecked::<Option<String>, _>(0)? {
            Some(raw) => Some(DbValue::Date(parse_stored_date(&raw).ok_or_else(|| {
                StoreError::Query(format!("'{}' is not a date", raw))
            })?)),
            None => None,
        },
        ValueType::Currency => match row.try_get_unchecked::<Option<f64>, _>(0)? {
            Some(raw) => Some(DbValue::Currency(Decimal::from_str(&raw.to_string()).map_err(
                |err| StoreError::Query(format!("'{}' is not a currency amount: {}", raw, err)),
            )?)),
            None => None,
        },
    };
    Ok(value)
}
