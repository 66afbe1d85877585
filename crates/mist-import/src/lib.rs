//! Pairs mail sources with the target store.
//!
//! Every source runs on its own blocking thread and streams messages through
//! a bounded channel. The store half (resolve, allocate, insert, commit) runs
//! under one lock so that sources never interleave their units of work.

pub mod history;
pub mod report;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mist_core::{DatabaseGateway, MessageRecord, SourceError, StoreError};
use mist_mail::MailSource;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use report::{MessageOutcome, MessageReport, SourceAbort, SourceReport};

const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_MAX_CONCURRENT_SOURCES: usize = 4;
const DEFAULT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Wall-clock budget for one source, connect included.
    pub source_timeout: Duration,
    pub max_concurrent_sources: usize,
    /// Messages fetched ahead of the store.
    pub channel_capacity: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            source_timeout: DEFAULT_SOURCE_TIMEOUT,
            max_concurrent_sources: DEFAULT_MAX_CONCURRENT_SOURCES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

enum SourceEvent {
    Message { position: u32, record: MessageRecord },
    Failed(SourceError),
}

pub struct ImportEngine {
    db: Arc<Mutex<DatabaseGateway>>,
    options: ImportOptions,
}

impl ImportEngine {
    pub fn new(db: Arc<Mutex<DatabaseGateway>>, options: ImportOptions) -> Self {
        Self { db, options }
    }

    /// Imports every source; reports come back in the order given.
    pub async fn run(&self, sources: Vec<MailSource>) -> Vec<SourceReport> {
        let concurrency = self.options.max_concurrent_sources.max(1);
        futures::stream::iter(sources.into_iter().map(|source| self.run_source(source)))
            .buffered(concurrency)
            .collect()
            .await
    }

    pub async fn run_source(&self, source: MailSource) -> SourceReport {
        let mut report = SourceReport::new(source.id(), source.name());
        let source_id = report.source_id;
        info!(source_id, source = %report.source_name, "Import started");

        let deadline = Instant::now() + self.options.source_timeout;
        let (tx, mut rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let producer = tokio::task::spawn_blocking(move || produce(source, tx));
        let mut position = 0;

        loop {
            let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    if let Err(err) = producer.await {
                        error!(source_id, "mail source worker failed: {}", err);
                        report.aborted = Some(SourceAbort {
                            position,
                            reason: format!("mail source worker failed: {}", err),
                        });
                    }
                    break;
                }
                Err(_) => {
                    error!(source_id, position, "source timed out");
                    report.aborted = Some(SourceAbort {
                        position,
                        reason: format!(
                            "timed out after {}s",
                            self.options.source_timeout.as_secs_f64()
                        ),
                    });
                    break;
                }
            };

            match event {
                SourceEvent::Message {
                    position: at,
                    record,
                } => {
                    position = at;
                    let result = {
                        let mut db = self.db.lock().await;
                        history::import_message(&mut db, &record).await
                    };
                    let outcome = match result {
                        Ok(outcome) => outcome,
                        Err(StoreError::Write(reason)) => {
                            warn!(source_id, position, "message not imported: {}", reason);
                            MessageOutcome::Failed { reason }
                        }
                        Err(err) => {
                            error!(source_id, position, "store failure, aborting source: {}", err);
                            report.aborted = Some(SourceAbort {
                                position,
                                reason: err.to_string(),
                            });
                            break;
                        }
                    };
                    debug!(source_id, position, outcome = ?outcome, "message processed");
                    report.messages.push(MessageReport {
                        position,
                        summary: record.to_string(),
                        outcome,
                    });
                }
                SourceEvent::Failed(err) => {
                    error!(source_id, "mail source failed: {}", err);
                    if let SourceError::Fetch { position: at, .. } = &err {
                        position = *at;
                    }
                    report.aborted = Some(SourceAbort {
                        position,
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }
        // Closing the channel stops the producer at its next send.
        drop(rx);

        info!(
            source_id,
            imported = report.imported(),
            skipped = report.skipped(),
            failed = report.failed(),
            complete = report.is_complete(),
            "Import finished"
        );
        report
    }
}

fn produce(mut source: MailSource, tx: mpsc::Sender<SourceEvent>) {
    if let Err(err) = source.connect(true) {
        let _ = tx.blocking_send(SourceEvent::Failed(err));
        return;
    }
    loop {
        match source.next_message() {
            Ok(Some(record)) => {
                let event = SourceEvent::Message {
                    position: source.cursor(),
                    record,
                };
                if tx.blocking_send(event).is_err() {
                    debug!(source_id = source.id(), "import stopped, closing source");
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = tx.blocking_send(SourceEvent::Failed(err));
                break;
            }
        }
    }
    source.disconnect();
}
