//! Subscription Bookkeeping
//!
//! Tracks which equipment ids the client wants live data for, and whether
//! the server has acknowledged each subscription on the current link.
//!
//! # Design
//!
//! An entry is created on the first `subscribe` for an id and destroyed only
//! by an explicit `unsubscribe`. A dropped link does not remove entries; it
//! only marks them unconfirmed so the connection manager can replay them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

// =============================================================================
// Types
// =============================================================================

/// Equipment identifier.
pub type EquipmentId = String;

/// Client-side record of a live-data subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    /// Subscribed equipment.
    pub equipment_id: EquipmentId,
    /// True while the latest call for this id was `subscribe`.
    pub active: bool,
    /// When the subscription was first requested.
    pub subscribed_at: DateTime<Utc>,
    /// Whether the server acknowledged it on the current link.
    pub confirmed: bool,
}

// =============================================================================
// Subscription Book
// =============================================================================

/// The set of subscriptions, keyed by equipment id.
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    entries: BTreeMap<EquipmentId, Subscription>,
}

impl SubscriptionBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the intent to subscribe. Returns true when the entry is new.
    pub fn record_intent(&mut self, equipment_id: &str, now: DateTime<Utc>) -> bool {
        if let Some(entry) = self.entries.get_mut(equipment_id) {
            entry.active = true;
            return false;
        }
        self.entries.insert(
            equipment_id.to_string(),
            Subscription {
                equipment_id: equipment_id.to_string(),
                active: true,
                subscribed_at: now,
                confirmed: false,
            },
        );
        true
    }

    /// Whether a server request is still needed for this id.
    #[must_use]
    pub fn needs_request(&self, equipment_id: &str) -> bool {
        self.entries
            .get(equipment_id)
            .is_some_and(|entry| entry.active && !entry.confirmed)
    }

    /// Mark an id as acknowledged by the server.
    ///
    /// Returns false when the entry was removed in the meantime.
    pub fn confirm(&mut self, equipment_id: &str) -> bool {
        match self.entries.get_mut(equipment_id) {
            Some(entry) if entry.active => {
                entry.confirmed = true;
                true
            }
            _ => false,
        }
    }

    /// Remove an entry, returning it.
    pub fn remove(&mut self, equipment_id: &str) -> Option<Subscription> {
        self.entries.remove(equipment_id)
    }

    /// Mark every entry unconfirmed after the link dropped.
    ///
    /// Returns how many entries were confirmed before.
    pub fn mark_all_unconfirmed(&mut self) -> usize {
        let mut cleared = 0;
        for entry in self.entries.values_mut() {
            if entry.confirmed {
                entry.confirmed = false;
                cleared += 1;
            }
        }
        cleared
    }

    /// Ids with `active = true`, in sorted order.
    #[must_use]
    pub fn active_ids(&self) -> Vec<EquipmentId> {
        self.entries
            .values()
            .filter(|entry| entry.active)
            .map(|entry| entry.equipment_id.clone())
            .collect()
    }

    /// Look up a subscription.
    #[must_use]
    pub fn get(&self, equipment_id: &str) -> Option<&Subscription> {
        self.entries.get(equipment_id)
    }

    /// Whether an id is actively subscribed.
    #[must_use]
    pub fn is_active(&self, equipment_id: &str) -> bool {
        self.entries.get(equipment_id).is_some_and(|entry| entry.active)
    }

    /// All subscriptions, in sorted order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries.values().cloned().collect()
    }

    /// Number of confirmed subscriptions.
    #[must_use]
    pub fn confirmed_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.confirmed).count()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the book is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
