use std::fmt;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// An address-like identity: `id` is the stable key, `name` is for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A normalized snapshot of one message pulled from a mail source.
///
/// Cloning is a deep copy; a clone never shares the recipient list with
/// the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub source_id: i64,
    pub source_name: String,
    pub date: NaiveDateTime,
    pub from_id: String,
    pub from_name: String,
    pub recipients: Vec<Identity>,
    pub subject: String,
    pub body: String,
    /// When false, a message whose natural key already has a history row is
    /// skipped instead of written again.
    pub add_existing_history: bool,
}

impl Default for MessageRecord {
    fn default() -> Self {
        Self {
            source_id: 0,
            source_name: String::new(),
            date: Local::now().naive_local(),
            from_id: String::new(),
            from_name: String::new(),
            recipients: Vec::new(),
            subject: String::new(),
            body: String::new(),
            add_existing_history: true,
        }
    }
}

impl MessageRecord {
    pub fn sender(&self) -> Identity {
        Identity::new(self.from_id.clone(), self.from_name.clone())
    }
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "from:{}|{}; date:{}; source:{}|{}",
            self.from_id, self.from_name, self.date, self.source_id, self.source_name
        )?;
        if !self.add_existing_history {
            write!(f, "; ** add_existing_history=false **")?;
        }
        Ok(())
    }
}
