use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scim_contracts::{SipRequest, SipResponse};
use scim_kernel::Block;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Routing state of a dialog whose traffic went through a service block.
#[derive(Debug, Clone)]
pub struct ActiveFlow {
    pub original_request: SipRequest,
    pub last_request: SipRequest,
    pub last_block: Arc<Block>,
    pub last_response: Option<SipResponse>,
    pub updated_at: DateTime<Utc>,
}

impl ActiveFlow {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Default)]
struct DialogSlot {
    retired: bool,
    active: Option<ActiveFlow>,
}

/// Exclusive access to one dialog's slot for the duration of an event.
pub struct DialogGuard {
    dialog_id: String,
    slot: OwnedMutexGuard<DialogSlot>,
    active_flows: Arc<AtomicUsize>,
}

impl DialogGuard {
    pub fn dialog_id(&self) -> &str {
        &self.dialog_id
    }

    pub fn active(&self) -> Option<&ActiveFlow> {
        self.slot.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveFlow> {
        self.slot.active.as_mut()
    }

    /// Records a forward produced by `block`. The first forward of a dialog
    /// pins `request` as its original request.
    pub fn upsert(&mut self, request: &SipRequest, forwarded: SipRequest, block: Arc<Block>) {
        match self.slot.active.as_mut() {
            Some(active) => {
                active.last_request = forwarded;
                active.last_block = block;
                active.touch();
            }
            None => {
                self.active_flows.fetch_add(1, Ordering::Relaxed);
                self.slot.active = Some(ActiveFlow {
                    original_request: request.clone(),
                    last_request: forwarded,
                    last_block: block,
                    last_response: None,
                    updated_at: Utc::now(),
                });
            }
        }
    }

    pub fn clear(&mut self) {
        if self.slot.active.take().is_some() {
            self.active_flows.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Dialog-id keyed table of active flows. Events of one dialog are handled
/// one at a time; distinct dialogs proceed in parallel.
#[derive(Debug, Default)]
pub struct DialogTable {
    slots: DashMap<String, Arc<Mutex<DialogSlot>>>,
    active_flows: Arc<AtomicUsize>,
}

impl DialogTable {
    /// Locks the dialog's slot, creating it if absent.
    pub async fn acquire(&self, dialog_id: &str) -> DialogGuard {
        loop {
            let slot = Arc::clone(self.slots.entry(dialog_id.to_string()).or_default().value());
            let guard = slot.lock_owned().await;
            // a slot retired while we waited is no longer in the table
            if !guard.retired {
                return DialogGuard {
                    dialog_id: dialog_id.to_string(),
                    slot: guard,
                    active_flows: Arc::clone(&self.active_flows),
                };
            }
        }
    }

    /// Locks the dialog's slot only if the dialog is known.
    pub async fn acquire_existing(&self, dialog_id: &str) -> Option<DialogGuard> {
        loop {
            let slot = Arc::clone(self.slots.get(dialog_id)?.value());
            let guard = slot.lock_owned().await;
            if !guard.retired {
                return Some(DialogGuard {
                    dialog_id: dialog_id.to_string(),
                    slot: guard,
                    active_flows: Arc::clone(&self.active_flows),
                });
            }
        }
    }

    /// Unlocks the slot; a slot left without an active flow is dropped.
    pub fn release(&self, mut guard: DialogGuard) {
        if guard.slot.active.is_some() {
            return;
        }
        guard.slot.retired = true;
        let slot = Arc::clone(OwnedMutexGuard::mutex(&guard.slot));
        self.slots
            .remove_if(&guard.dialog_id, |_, current| Arc::ptr_eq(current, &slot));
    }

    /// Drops flows untouched since `cutoff`. Slots locked by an in-flight
    /// event are skipped.
    pub fn evict_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        self.slots.retain(|_, slot| match slot.try_lock() {
            Ok(mut guard) => {
                let stale = guard
                    .active
                    .as_ref()
                    .map(|active| active.updated_at < cutoff)
                    .unwrap_or(true);
                if stale {
                    guard.retired = true;
                    if guard.active.take().is_some() {
                        self.active_flows.fetch_sub(1, Ordering::Relaxed);
                        evicted += 1;
                    }
                }
                !stale
            }
            Err(_) => true,
        });
        evicted
    }

    pub async fn get(&self, dialog_id: &str) -> Option<ActiveFlow> {
        let guard = self.acquire_existing(dialog_id).await?;
        guard.active().cloned()
    }

    /// Dialogs currently holding an active flow. Slots locked by events that
    /// never reached a service block are not counted.
    pub fn active_count(&self) -> usize {
        self.active_flows.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
