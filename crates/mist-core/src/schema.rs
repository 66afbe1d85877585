//! The fixed set of tables MIST reads and writes.

use crate::error::StoreError;
use crate::gateway::DatabaseGateway;

pub const TABLE_CONTACT: &str = "Contact";
pub const TABLE_EMAIL: &str = "Email";
pub const TABLE_HISTORY: &str = "History";
pub const TABLE_HISTORYCONTACT: &str = "HistoryContact";
pub const TABLE_TASKTYPE: &str = "TaskType";
pub const TABLE_MPDPHASE: &str = "MPDPhase";
pub const TABLE_PLEDGEFREQUENCY: &str = "PledgeFrequency";

pub const TASKTYPE_EMAIL: i64 = 100;
pub const HISTORY_DESCRIPTION_MAX_LEN: usize = 150;

/// Primary key column of a target table: `History` is keyed by `HistoryID`.
pub fn primary_key(table: &str) -> String {
    format!("{}ID", table)
}

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE [Contact] (
        [ContactID] INTEGER PRIMARY KEY,
        [FileAs] TEXT,
        [LastEdit] TEXT
    )",
    "CREATE TABLE [Email] (
        [EmailID] INTEGER PRIMARY KEY,
        [ContactID] INTEGER NOT NULL,
        [Address] TEXT NOT NULL,
        [LastEdit] TEXT
    )",
    "CREATE INDEX [Email_Address] ON [Email] ([Address] COLLATE NOCASE)",
    "CREATE TABLE [History] (
        [HistoryID] INTEGER PRIMARY KEY,
        [HistoryDate] TEXT NOT NULL,
        [Description] TEXT,
        [Notes] TEXT,
        [TaskTypeID] INTEGER,
        [SourceID] INTEGER,
        [SourceName] TEXT,
        [FromKey] TEXT,
        [FromName] TEXT,
        [LastEdit] TEXT
    )",
    "CREATE INDEX [History_NaturalKey] ON [History] ([SourceID], [FromKey], [HistoryDate])",
    "CREATE TABLE [HistoryContact] (
        [HistoryContactID] INTEGER PRIMARY KEY,
        [HistoryID] INTEGER NOT NULL,
        [ContactID] INTEGER,
        [IdentityKey] TEXT,
        [IdentityName] TEXT,
        [IsSender] INTEGER NOT NULL DEFAULT 0,
        [IsUnknown] INTEGER NOT NULL DEFAULT 0,
        [LastEdit] TEXT
    )",
    "CREATE TABLE [TaskType] ([TaskTypeID] INTEGER PRIMARY KEY, [Description] TEXT)",
    "CREATE TABLE [MPDPhase] ([MPDPhaseID] INTEGER PRIMARY KEY, [Description] TEXT)",
    "CREATE TABLE [PledgeFrequency] ([PledgeFrequencyID] INTEGER PRIMARY KEY, [Description] TEXT)",
    "INSERT INTO [TaskType] ([TaskTypeID],[Description]) VALUES (60,'Newsletter'),(100,'Email')",
];

/// Installs the target tables into an empty store and commits.
pub async fn create_tables(gateway: &mut DatabaseGateway) -> Result<(), StoreError> {
    for statement in CREATE_TABLES {
        gateway.execute(statement).await?;
    }
    gateway.commit().await
}
