//! Commit notifications for observers of local tables.

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Emitted after a transaction touching `table` commits.
#[derive(Debug, Clone, PartialEq)]
pub struct TableChange {
    pub table: &'static str,
    pub owner_id: String,
    pub revision: i64,
    /// Set when the listener fell behind and must re-read instead of trusting the filter.
    pub lagged: bool,
}

type Predicate = Box<dyn Fn(&TableChange) -> bool + Send + Sync>;

/// Fan-out of committed table changes.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<TableChange>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, table: &'static str, owner_id: &str, revision: i64) {
        // No receivers is the normal case on a headless device
        let _ = self.tx.send(TableChange {
            table,
            owner_id: owner_id.to_string(),
            revision,
            lagged: false,
        });
    }

    /// Register a listener that re-fires on any commit touching `table` and matching `predicate`.
    pub fn subscribe<F>(&self, table: &'static str, predicate: F) -> Subscription
    where
        F: Fn(&TableChange) -> bool + Send + Sync + 'static,
    {
        Subscription {
            rx: self.tx.subscribe(),
            table,
            predicate: Box::new(predicate),
        }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<TableChange>,
    table: &'static str,
    predicate: Predicate,
}

impl Subscription {
    /// Wait for the next matching commit. Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<TableChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.table == self.table && (self.predicate)(&change) => {
                    return Some(change)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(table = self.table, missed, "Change listener lagged");
                    return Some(TableChange {
                        table: self.table,
                        owner_id: String::new(),
                        revision: 0,
                        lagged: true,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
