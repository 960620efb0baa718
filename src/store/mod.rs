//! Backing-store abstraction.
//!
//! This module provides:
//! - `ContactStore` trait the cache drives through asynchronous requests
//! - Request, result and change-notification types
//! - `LocalStore`, an in-process store with optional SQLite persistence

pub mod filter;
pub mod local;
pub mod sqlite;

use tokio::sync::{broadcast, mpsc};

use crate::contact::{Contact, ContactId, FetchHint};
use crate::error::StoreResult;

pub use filter::{DetailField, Filter, MatchMode, SortField, SortOrder};
pub use local::{Journal, LocalStore, LocalStoreOptions, MemoryJournal, SELF_CONTACT_ID};
pub use sqlite::SqliteJournal;

/// Identifies one started request in the events it produces.
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    /// `first` is an aggregate and `second` one of its constituents.
    Aggregates,
    /// `first` and `second` must not be aggregated together again.
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Relationship {
    pub kind: RelationshipKind,
    pub first: ContactId,
    pub second: ContactId,
}

impl Relationship {
    pub fn aggregates(first: ContactId, second: ContactId) -> Self {
        Self {
            kind: RelationshipKind::Aggregates,
            first,
            second,
        }
    }

    pub fn is_not(first: ContactId, second: ContactId) -> Self {
        Self {
            kind: RelationshipKind::IsNot,
            first,
            second,
        }
    }
}

/// The kinds of request the cache issues. At most one of each is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Fetch,
    FetchById,
    QueryIds,
    FetchRelationships,
    Save,
    Remove,
    SaveRelationships,
    RemoveRelationships,
}

#[derive(Debug, Clone)]
pub enum StoreRequest {
    /// Contacts matching `filter`, sorted, restricted to `hint`.
    Fetch {
        filter: Filter,
        sort: SortOrder,
        hint: FetchHint,
    },
    FetchById {
        ids: Vec<ContactId>,
        hint: FetchHint,
    },
    QueryIds {
        filter: Filter,
        sort: SortOrder,
    },
    FetchRelationships {
        first: ContactId,
        kind: RelationshipKind,
    },
    /// Contacts with id `0` are created; others are updated.
    Save(Vec<Contact>),
    Remove(Vec<ContactId>),
    SaveRelationships(Vec<Relationship>),
    RemoveRelationships(Vec<Relationship>),
}

impl StoreRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            StoreRequest::Fetch { .. } => RequestKind::Fetch,
            StoreRequest::FetchById { .. } => RequestKind::FetchById,
            StoreRequest::QueryIds { .. } => RequestKind::QueryIds,
            StoreRequest::FetchRelationships { .. } => RequestKind::FetchRelationships,
            StoreRequest::Save(_) => RequestKind::Save,
            StoreRequest::Remove(_) => RequestKind::Remove,
            StoreRequest::SaveRelationships(_) => RequestKind::SaveRelationships,
            StoreRequest::RemoveRelationships(_) => RequestKind::RemoveRelationships,
        }
    }
}

/// Progress of a request. Any number of result batches, then exactly one
/// `Finished`.
#[derive(Debug)]
pub enum StoreEvent {
    Contacts(Vec<Contact>),
    Ids(Vec<ContactId>),
    Relationships(Vec<Relationship>),
    Finished(StoreResult<()>),
}

#[derive(Debug)]
pub struct StoreMessage {
    pub request: RequestId,
    pub event: StoreEvent,
}

/// Where a store reports the progress of one request.
#[derive(Debug, Clone)]
pub struct EventSink {
    request: RequestId,
    tx: mpsc::UnboundedSender<StoreMessage>,
}

impl EventSink {
    pub fn new(request: RequestId, tx: mpsc::UnboundedSender<StoreMessage>) -> Self {
        Self { request, tx }
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    /// Returns false once nobody listens any more.
    pub fn emit(&self, event: StoreEvent) -> bool {
        self.tx
            .send(StoreMessage {
                request: self.request,
                event,
            })
            .is_ok()
    }
}

/// Store-side change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotification {
    Added(Vec<ContactId>),
    Changed(Vec<ContactId>),
    Removed(Vec<ContactId>),
    /// Too much changed to enumerate; everything should be re-read.
    DataChanged,
}

/// An asynchronous contact store.
///
/// `start` must not block: it hands the request to the store's own
/// execution context and returns. Requests finish in submission order.
pub trait ContactStore: Send + Sync + 'static {
    fn start(&self, request: StoreRequest, sink: EventSink);

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification>;

    /// Id of the contact representing the device owner.
    fn self_contact_id(&self) -> ContactId;
}
