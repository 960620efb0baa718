use std::sync::Arc;

use super::listeners::{ItemData, ItemListener, Registry};
use crate::contact::{Contact, ContactId};

/// How much of a contact the cache holds. Ordered by completeness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContactState {
    #[default]
    Absent,
    Requested,
    Partial,
    Complete,
}

/// Snapshot of a cache item handed to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedContact {
    pub id: ContactId,
    pub state: ContactState,
    pub contact: Contact,
    pub display_label: String,
    /// Empty for contacts that are not grouped.
    pub name_group: String,
}

impl CachedContact {
    pub fn is_complete(&self) -> bool {
        self.state == ContactState::Complete
    }
}

pub(crate) struct CacheItem {
    pub contact: Contact,
    pub state: ContactState,
    pub display_label: String,
    pub name_group: String,
    pub listeners: Registry<dyn ItemListener>,
    pub data: Option<Arc<dyn ItemData>>,
    /// Constituents as of the last constituent fetch.
    pub constituents: Option<Vec<ContactId>>,
}

impl CacheItem {
    pub fn new(id: ContactId) -> Self {
        Self {
            contact: Contact {
                id,
                ..Default::default()
            },
            state: ContactState::Absent,
            display_label: String::new(),
            name_group: String::new(),
            listeners: Registry::default(),
            data: None,
            constituents: None,
        }
    }

    pub fn id(&self) -> ContactId {
        self.contact.id
    }

    /// Record the outcome of a fetch. A partial fetch never takes a
    /// complete item back to partial.
    pub fn advance_state(&mut self, partial: bool) {
        self.state = match (self.state, partial) {
            (_, false) => ContactState::Complete,
            (ContactState::Complete, true) => ContactState::Complete,
            (_, true) => ContactState::Partial,
        };
    }

    pub fn snapshot(&self) -> CachedContact {
        CachedContact {
            id: self.id(),
            state: self.state,
            contact: self.contact.clone(),
            display_label: self.display_label.clone(),
            name_group: self.name_group.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_fetch_never_downgrades() {
        let mut item = CacheItem::new(4);
        assert_eq!(item.state, ContactState::Absent);

        item.advance_state(true);
        assert_eq!(item.state, ContactState::Partial);

        item.advance_state(false);
        assert_eq!(item.state, ContactState::Complete);

        item.advance_state(true);
        assert_eq!(item.state, ContactState::Complete);
    }

    #[test]
    fn test_requested_item_becomes_partial() {
        let mut item = CacheItem::new(4);
        item.state = ContactState::Requested;
        item.advance_state(true);
        assert_eq!(item.state, ContactState::Partial);
        assert!(!item.snapshot().is_complete());
    }
}
