use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Imported { history_id: i64 },
    /// A history row with the same natural key already existed.
    Skipped,
    /// The store rejected the write; the message's statements were rolled back.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReport {
    /// 1-based position in the source folder.
    pub position: u32,
    pub summary: String,
    pub outcome: MessageOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAbort {
    pub position: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source_id: i64,
    pub source_name: String,
    pub messages: Vec<MessageReport>,
    pub aborted: Option<SourceAbort>,
}

impl SourceReport {
    pub fn new(source_id: i64, source_name: impl Into<String>) -> Self {
        Self {
            source_id,
            source_name: source_name.into(),
            messages: Vec::new(),
            aborted: None,
        }
    }

    pub fn imported(&self) -> usize {
        self.count(|o| matches!(o, MessageOutcome::Imported { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, MessageOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, MessageOutcome::Failed { .. }))
    }

    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }

    fn count(&self, pred: impl Fn(&MessageOutcome) -> bool) -> usize {
        self.messages.iter().filter(|m| pred(&m.outcome)).count()
    }
}

impl fmt::Display for SourceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "source {}|{}: {} imported, {} skipped, {} failed",
            self.source_id,
            self.source_name,
            self.imported(),
            self.skipped(),
            self.failed()
        )?;
        if let Some(abort) = &self.aborted {
            write!(f, "; aborted at message {}: {}", abort.position, abort.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for MessageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            MessageOutcome::Imported { history_id } => {
                write!(f, "#{} imported as history {}: {}", self.position, history_id, self.summary)
            }
            MessageOutcome::Skipped => write!(f, "#{} skipped: {}", self.position, self.summary),
            MessageOutcome::Failed { reason } => {
                write!(f, "#{} failed ({}): {}", self.position, reason, self.summary)
            }
        }
    }
}
