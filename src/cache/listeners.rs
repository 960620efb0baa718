//! Consumer-facing callback traits and the registries holding them.
//!
//! Every registration returns a [`Subscription`] token. Callbacks are never
//! invoked while the cache is locked, so they may call back into it.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::address::{Address, AddressKey};
use super::item::CachedContact;
use super::view::View;
use crate::contact::{Contact, ContactId};
use crate::label::{DisplayLabelOrder, NameProperty};

/// Token identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription(u64);

impl Subscription {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Subscription(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Structural and data changes of one view.
///
/// Row ranges are half-open and refer to the view as it was when the edit
/// was made. Edits of a pass are delivered in order.
#[allow(unused_variables)]
pub trait ViewListener: Send + Sync {
    fn about_to_remove(&self, view: View, rows: Range<usize>) {}
    fn removed(&self, view: View, rows: Range<usize>) {}
    fn about_to_insert(&self, view: View, rows: Range<usize>) {}
    fn inserted(&self, view: View, rows: Range<usize>, ids: &[ContactId]) {}
    /// Data of the contact at `row` changed without moving it.
    fn data_changed(&self, view: View, row: usize) {}
    /// A synchronization pass finished.
    fn items_changed(&self, view: View) {}
    /// The view holds its first complete result.
    fn populated(&self, view: View) {}
    fn display_label_order_changed(&self, order: DisplayLabelOrder) {}
    fn sort_property_changed(&self, property: NameProperty) {}
    fn group_property_changed(&self, property: NameProperty) {}
}

#[allow(unused_variables)]
pub trait ChangeListener: Send + Sync {
    fn item_updated(&self, item: &CachedContact) {}
    fn item_about_to_be_removed(&self, id: ContactId) {}
    /// Keys whose resolution to a contact may now differ.
    fn address_resolutions_changed(&self, keys: &HashSet<AddressKey>) {}
}

pub trait ResolveListener: Send + Sync {
    /// Called exactly once per resolve call that returned `None` for an
    /// indexable address. `item` is `None` when no contact matches; such
    /// addresses stay tracked and a later matching contact is reported with
    /// another call.
    fn address_resolved(&self, address: &Address, item: Option<&CachedContact>);
}

#[allow(unused_variables)]
pub trait ItemListener: Send + Sync {
    fn item_updated(&self, item: &CachedContact) {}
    fn item_about_to_be_removed(&self, id: ContactId) {}
}

pub trait NameGroupListener: Send + Sync {
    /// Current members of every group whose membership changed.
    fn name_groups_updated(&self, groups: &HashMap<String, HashSet<ContactId>>);
}

/// Per-contact consumer state attached to a cache item.
#[allow(unused_variables)]
pub trait ItemData: Send + Sync {
    fn contact_updated(&self, item: &CachedContact) {}
    fn constituents_fetched(&self, ids: &[ContactId]) {}
    fn merge_candidates_fetched(&self, ids: &[ContactId]) {}
    fn aggregation_operation_completed(&self) {}
    fn display_label_order_changed(&self, order: DisplayLabelOrder) {}
}

/// Locale-aware grouping. Returning `None` falls back to the built-in
/// ASCII bucketing.
pub trait NameGrouper: Send + Sync {
    fn name_group(&self, contact: &Contact, property: NameProperty) -> Option<String>;

    fn all_groups(&self) -> Vec<String>;
}

pub(crate) struct Registry<T: ?Sized> {
    entries: Vec<(Subscription, Arc<T>)>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn add(&mut self, listener: Arc<T>) -> Subscription {
        let subscription = Subscription::next();
        self.entries.push((subscription, listener));
        subscription
    }

    pub fn remove(&mut self, subscription: Subscription) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(s, _)| *s != subscription);
        before != self.entries.len()
    }

    pub fn get(&self, subscription: Subscription) -> Option<Arc<T>> {
        self.entries
            .iter()
            .find(|(s, _)| *s == subscription)
            .map(|(_, listener)| Arc::clone(listener))
    }

    pub fn contains(&self, subscription: Subscription) -> bool {
        self.entries.iter().any(|(s, _)| *s == subscription)
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
