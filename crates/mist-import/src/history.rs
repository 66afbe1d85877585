//! Writes one message as a `[History]` row plus its `[HistoryContact]` links.

use std::collections::BTreeSet;

use chrono::Local;
use mist_core::format::{build_insert, format_bool, format_date, format_int, format_string};
use mist_core::schema::{
    HISTORY_DESCRIPTION_MAX_LEN, TABLE_CONTACT, TABLE_HISTORY, TABLE_HISTORYCONTACT, TASKTYPE_EMAIL,
};
use mist_core::{DatabaseGateway, Identity, MessageRecord, StoreError};
use tracing::{debug, warn};

use crate::report::MessageOutcome;

/// Imports `record` as one unit of work.
///
/// Everything is committed together, or rolled back together on error.
pub async fn import_message(
    db: &mut DatabaseGateway,
    record: &MessageRecord,
) -> Result<MessageOutcome, StoreError> {
    match write_message(db, record).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if let Err(rollback_err) = db.rollback().await {
                warn!("rollback after failed import also failed: {}", rollback_err);
            }
            Err(err)
        }
    }
}

async fn write_message(
    db: &mut DatabaseGateway,
    record: &MessageRecord,
) -> Result<MessageOutcome, StoreError> {
    if !record.add_existing_history && history_exists(db, record).await? {
        debug!(source_id = record.source_id, from = %record.from_id, "history already present");
        return Ok(MessageOutcome::Skipped);
    }

    let links = link_identities(record);
    let mut resolved = Vec::with_capacity(links.len());
    for (identity, is_sender) in links {
        let contact_id = resolve_contact(db, &identity.id).await?;
        resolved.push((identity, is_sender, contact_id));
    }

    let history_id = db.allocate_id(TABLE_HISTORY, true).await?;
    let now = format_date(Some(Local::now().naive_local()), true);
    let history = build_insert(
        TABLE_HISTORY,
        &[
            ("HistoryID", format_int(Some(history_id))),
            ("HistoryDate", format_date(Some(record.date), true)),
            (
                "Description",
                format_string(Some(&record.subject), Some(HISTORY_DESCRIPTION_MAX_LEN)),
            ),
            ("Notes", format_string(Some(&record.body), None)),
            ("TaskTypeID", format_int(Some(TASKTYPE_EMAIL))),
            ("SourceID", format_int(Some(record.source_id))),
            ("SourceName", format_string(Some(&record.source_name), None)),
            ("FromKey", format_string(Some(&record.from_id), None)),
            ("FromName", format_string(Some(&record.from_name), None)),
            ("LastEdit", now.clone()),
        ],
    );
    expect_one_row(db, &history).await?;

    let mut touched = BTreeSet::new();
    for (identity, is_sender, contact_id) in &resolved {
        let link_id = db.allocate_id(TABLE_HISTORYCONTACT, true).await?;
        let link = build_insert(
            TABLE_HISTORYCONTACT,
            &[
                ("HistoryContactID", format_int(Some(link_id))),
                ("HistoryID", format_int(Some(history_id))),
                ("ContactID", format_int(*contact_id)),
                ("IdentityKey", format_string(Some(&identity.id), None)),
                ("IdentityName", format_string(Some(&identity.name), None)),
                ("IsSender", format_bool(*is_sender)),
                ("IsUnknown", format_bool(contact_id.is_none())),
                ("LastEdit", now.clone()),
            ],
        );
        expect_one_row(db, &link).await?;
        if let Some(contact_id) = contact_id {
            touched.insert(*contact_id);
        }
    }

    for contact_id in touched {
        db.touch_last_edit(TABLE_CONTACT, contact_id).await?;
    }

    db.commit().await?;
    debug!(history_id, links = resolved.len(), "history written");
    Ok(MessageOutcome::Imported { history_id })
}

/// Sender first, then recipients; each key at most once, empty keys dropped.
fn link_identities(record: &MessageRecord) -> Vec<(Identity, bool)> {
    let mut seen = BTreeSet::new();
    std::iter::once((record.sender(), true))
        .chain(record.recipients.iter().cloned().map(|r| (r, false)))
        .filter(|(identity, _)| !identity.id.is_empty() && seen.insert(identity.id.to_lowercase()))
        .collect()
}

async fn history_exists(db: &mut DatabaseGateway, record: &MessageRecord) -> Result<bool, StoreError> {
    let sql = format!(
        "SELECT COUNT(*) FROM [History] WHERE [SourceID] = {} AND [FromKey] = {} AND [HistoryDate] = {}",
        format_int(Some(record.source_id)),
        format_string(Some(&record.from_id), None),
        format_date(Some(record.date), true)
    );
    Ok(db.query_one_int(Some(&sql)).await?.unwrap_or(0) > 0)
}

/// Contact owning the address `key`, compared case-insensitively.
///
/// When several contacts share the address the lowest id wins.
async fn resolve_contact(db: &mut DatabaseGateway, key: &str) -> Result<Option<i64>, StoreError> {
    let sql = format!(
        "SELECT [ContactID], [Address] FROM [Email] WHERE [Address] LIKE {}",
        format_string(Some(key), None)
    );
    let rows = db.query(&sql).await?;
    let mut matches = BTreeSet::new();
    for row in 0..rows.row_count() {
        let address = rows.get_string(row, "Address")?.unwrap_or_default();
        if !address.trim().eq_ignore_ascii_case(key) {
            continue;
        }
        if let Some(contact_id) = rows.get_int(row, "ContactID")? {
            matches.insert(contact_id);
        }
    }
    if matches.len() > 1 {
        warn!(address = key, contacts = ?matches, "address belongs to several contacts");
    }
    Ok(matches.into_iter().next())
}

async fn expect_one_row(db: &mut DatabaseGateway, sql: &str) -> Result<(), StoreError> {
    match db.execute(sql).await? {
        1 => Ok(()),
        n => Err(StoreError::Write(format!("expected 1 row, {} affected: {}", n, sql))),
    }
}
