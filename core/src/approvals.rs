//! Approval store with suspend/resume semantics
//!
//! A tool that requires approval registers an entry, emits a
//! `waiting_approval` event, and suspends on a per-approval notify
//! channel. An external approve/deny call (or TTL expiry) wakes it. A
//! periodic sweeper evicts expired entries; teardown cancels the sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Approval {
    pub id: String,
    pub request_id: String,
    pub tool: String,
    pub context: serde_json::Value,
    pub state: ApprovalState,
    pub reason: Option<String>,
    pub created: Instant,
}

struct Entry {
    approval: Approval,
    notify: Arc<Notify>,
}

/// Aggregate counts for metrics and alerting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalsSnapshot {
    pub pending: usize,
    pub approved: usize,
    pub denied: usize,
    pub avg_pending_age_secs: f64,
    pub max_pending_age_secs: f64,
}

/// Process-wide approvals store.
pub struct ApprovalsStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl ApprovalsStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a pending approval; returns its id.
    pub fn create(&self, request_id: &str, tool: &str, context: serde_json::Value) -> String {
        let id = Uuid::new_v4().to_string();
        let mut entries = self.lock();
        // Opportunistic prune on write.
        let ttl = self.ttl;
        entries.retain(|_, e| {
            e.approval.state != ApprovalState::Pending || e.approval.created.elapsed() < ttl
        });
        entries.insert(
            id.clone(),
            Entry {
                approval: Approval {
                    id: id.clone(),
                    request_id: request_id.to_string(),
                    tool: tool.to_string(),
                    context,
                    state: ApprovalState::Pending,
                    reason: None,
                    created: Instant::now(),
                },
                notify: Arc::new(Notify::new()),
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> Option<Approval> {
        self.lock().get(id).map(|e| e.approval.clone())
    }

    /// Resolve a pending approval and wake any waiter. Returns the new
    /// state, or `None` for unknown/expired ids.
    pub fn resolve(&self, id: &str, approved: bool, reason: Option<String>) -> Option<ApprovalState> {
        let mut entries = self.lock();
        let entry = entries.get_mut(id)?;
        if entry.approval.state != ApprovalState::Pending {
            return Some(entry.approval.state);
        }
        entry.approval.state = if approved {
            ApprovalState::Approved
        } else {
            ApprovalState::Denied
        };
        entry.approval.reason = reason;
        entry.notify.notify_waiters();
        Some(entry.approval.state)
    }

    /// Suspend until the approval resolves or its TTL expires.
    pub async fn wait(&self, id: &str) -> ApprovalState {
        loop {
            let (state, notify, remaining) = {
                let entries = self.lock();
                let Some(entry) = entries.get(id) else {
                    return ApprovalState::Expired;
                };
                let elapsed = entry.approval.created.elapsed();
                let remaining = self.ttl.checked_sub(elapsed);
                (entry.approval.state, Arc::clone(&entry.notify), remaining)
            };
            if state != ApprovalState::Pending {
                return state;
            }
            let Some(remaining) = remaining else {
                self.expire(id);
                return ApprovalState::Expired;
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(remaining) => {
                    self.expire(id);
                    return ApprovalState::Expired;
                }
            }
        }
    }

    fn expire(&self, id: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(id) {
            if entry.approval.state == ApprovalState::Pending {
                entry.approval.state = ApprovalState::Expired;
                entry.notify.notify_waiters();
            }
        }
    }

    /// Remove entries whose TTL elapsed (expiring pending ones first).
    pub fn sweep(&self) -> usize {
        let mut entries = self.lock();
        let ttl = self.ttl;
        let before = entries.len();
        for entry in entries.values_mut() {
            if entry.approval.state == ApprovalState::Pending && entry.approval.created.elapsed() >= ttl
            {
                entry.approval.state = ApprovalState::Expired;
                entry.notify.notify_waiters();
            }
        }
        entries.retain(|_, e| e.approval.created.elapsed() < ttl * 2);
        before - entries.len()
    }

    pub fn snapshot(&self) -> ApprovalsSnapshot {
        let entries = self.lock();
        let mut snapshot = ApprovalsSnapshot::default();
        let mut pending_ages = Vec::new();
        for entry in entries.values() {
            match entry.approval.state {
                ApprovalState::Pending => {
                    snapshot.pending += 1;
                    pending_ages.push(entry.approval.created.elapsed().as_secs_f64());
                }
                ApprovalState::Approved => snapshot.approved += 1,
                ApprovalState::Denied => snapshot.denied += 1,
                ApprovalState::Expired => {}
            }
        }
        if !pending_ages.is_empty() {
            snapshot.avg_pending_age_secs =
                pending_ages.iter().sum::<f64>() / pending_ages.len() as f64;
            snapshot.max_pending_age_secs =
                pending_ages.iter().fold(0.0f64, |acc, v| acc.max(*v));
        }
        snapshot
    }
}

/// Spawn the periodic sweeper; stops when `cancel` fires.
pub fn spawn_sweeper(
    store: Arc<ApprovalsStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    store.sweep();
                }
            }
        }
    })
}
