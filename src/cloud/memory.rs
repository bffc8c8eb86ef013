//! In-process cloud store, used when no remote endpoint is configured and by tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{merge_document, CloudDocument, CloudStore, ConsumeOutcome};
use crate::errors::AppError;
use crate::models::{DriverLink, InviteCode};

type CollectionKey = (String, String);

#[derive(Default)]
struct State {
    documents: HashMap<CollectionKey, BTreeMap<String, Value>>,
    invites: HashMap<String, InviteCode>,
    driver_links: HashMap<String, DriverLink>,
}

/// Cloud store held in memory, with switches to simulate an unreachable backend.
#[derive(Default)]
pub struct MemoryCloudStore {
    state: Mutex<State>,
    offline: AtomicBool,
    fail_next: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryCloudStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a retryable sync error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` calls, then recover.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of document writes accepted so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Place a document directly, as another device or a misbehaving backend would.
    pub async fn seed_document(&self, owner_id: &str, collection: &str, doc_id: &str, data: Value) {
        let mut state = self.state.lock().await;
        state
            .documents
            .entry((owner_id.to_string(), collection.to_string()))
            .or_default()
            .insert(doc_id.to_string(), data);
    }

    pub async fn driver_link(&self, device_id: &str) -> Option<DriverLink> {
        self.state.lock().await.driver_links.get(device_id).cloned()
    }

    fn check_reachable(&self) -> Result<(), AppError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::Sync("Cloud store unreachable".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AppError::Sync("Cloud store request failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudStore for MemoryCloudStore {
    async fn set_document(
        &self,
        owner_id: &str,
        collection: &str,
        doc_id: &str,
        data: Value,
    ) -> Result<(), AppError> {
        self.check_reachable()?;
        let mut state = self.state.lock().await;
        let docs = state
            .documents
            .entry((owner_id.to_string(), collection.to_string()))
            .or_default();
        match docs.get_mut(doc_id) {
            Some(existing) => merge_document(existing, data),
            None => {
                docs.insert(doc_id.to_string(), data);
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_document(
        &self,
        owner_id: &str,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<CloudDocument>, AppError> {
        self.check_reachable()?;
        let state = self.state.lock().await;
        Ok(state
            .documents
            .get(&(owner_id.to_string(), collection.to_string()))
            .and_then(|docs| docs.get(doc_id))
            .map(|data| CloudDocument {
                id: doc_id.to_string(),
                data: data.clone(),
            }))
    }

    async fn list_documents(
        &self,
        owner_id: &str,
        collection: &str,
    ) -> Result<Vec<CloudDocument>, AppError> {
        self.check_reachable()?;
        let state = self.state.lock().await;
        Ok(state
            .documents
            .get(&(owner_id.to_string(), collection.to_string()))
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| CloudDocument {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>, AppError> {
        self.check_reachable()?;
        Ok(self.state.lock().await.invites.get(code).cloned())
    }

    async fn create_invite(&self, invite: &InviteCode) -> Result<bool, AppError> {
        self.check_reachable()?;
        let mut state = self.state.lock().await;
        if state.invites.contains_key(&invite.code) {
            return Ok(false);
        }
        state.invites.insert(invite.code.clone(), invite.clone());
        Ok(true)
    }

    async fn consume_invite(
        &self,
        code: &str,
        device_id: &str,
        used_at: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, AppError> {
        self.check_reachable()?;
        let mut state = self.state.lock().await;
        let Some(invite) = state.invites.get_mut(code) else {
            return Ok(ConsumeOutcome::NotFound);
        };
        if invite.used {
            return Ok(ConsumeOutcome::AlreadyUsed);
        }
        if used_at > invite.expires_at {
            return Ok(ConsumeOutcome::Expired);
        }
        invite.used = true;
        invite.used_by = Some(device_id.to_string());
        invite.used_at = Some(used_at);
        Ok(ConsumeOutcome::Consumed)
    }

    async fn put_driver_link(&self, link: &DriverLink) -> Result<(), AppError> {
        self.check_reachable()?;
        self.state
            .lock()
            .await
            .driver_links
            .insert(link.device_id.clone(), link.clone());
        Ok(())
    }
}
