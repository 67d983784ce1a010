//! Results of tool calls dispatched by a relay, keyed by call id. A result
//! may land after the stream that announced the call has finished, so
//! callers retrieve it here instead of on the event stream.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::mcp::ToolResult;

struct Slot {
    tx: watch::Sender<Option<ToolResult>>,
    published_at: Option<Instant>,
}

impl Slot {
    fn new() -> Self {
        Self {
            tx: watch::channel(None).0,
            published_at: None,
        }
    }
}

/// Published results are kept for one wait window after publication; slots
/// still awaiting their result are kept until it lands.
pub struct ToolResults {
    slots: Mutex<HashMap<String, Slot>>,
    wait_timeout: Duration,
}

impl ToolResults {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let retention = self.wait_timeout;
        slots.retain(|_, slot| {
            slot.published_at
                .map_or(true, |published| published.elapsed() <= retention)
        });
        slots
    }

    fn sender(&self, call_id: &str) -> watch::Sender<Option<ToolResult>> {
        self.slots()
            .entry(call_id.to_string())
            .or_insert_with(Slot::new)
            .tx
            .clone()
    }

    /// Marks a call as dispatched so waiters block instead of missing it.
    pub fn expect(&self, call_id: &str) {
        self.slots()
            .entry(call_id.to_string())
            .or_insert_with(Slot::new);
    }

    pub fn publish(&self, call_id: &str, result: ToolResult) {
        let mut slots = self.slots();
        let slot = slots.entry(call_id.to_string()).or_insert_with(Slot::new);
        slot.published_at = Some(Instant::now());
        slot.tx.send_replace(Some(result));
    }

    /// Returns the stored result without waiting.
    pub fn get(&self, call_id: &str) -> Option<ToolResult> {
        self.slots()
            .get(call_id)
            .and_then(|slot| slot.tx.borrow().clone())
    }

    pub fn is_known(&self, call_id: &str) -> bool {
        self.slots().contains_key(call_id)
    }

    /// Waits for a result up to the configured timeout. Returns `None` on
    /// timeout.
    pub async fn wait(&self, call_id: &str) -> Option<ToolResult> {
        let mut receiver = self.sender(call_id).subscribe();
        let waited = tokio::time::timeout(
            self.wait_timeout,
            receiver.wait_for(Option::is_some),
        )
        .await;
        match waited {
            Ok(Ok(value)) => Option::clone(&value),
            _ => None,
        }
    }

    /// Waits for a result and releases its slot once delivered.
    pub async fn take(&self, call_id: &str) -> Option<ToolResult> {
        let result = self.wait(call_id).await?;
        self.forget(call_id);
        Some(result)
    }

    pub fn forget(&self, call_id: &str) -> Option<ToolResult> {
        self.slots()
            .remove(call_id)
            .and_then(|slot| slot.tx.borrow().clone())
    }
}
