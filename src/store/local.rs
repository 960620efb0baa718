//! In-process contact store.
//!
//! `LocalStore` keeps the whole address book in memory and executes requests
//! strictly in submission order on a worker task, streaming results in
//! batches like a real backend would. It models aggregation:
//!
//! - every newly created raw contact is a constituent of a fresh aggregate
//! - an aggregate's details are the union of its constituents' details
//! - saving an aggregate writes its details into its local constituent
//! - removing an aggregate removes its constituents
//! - constituents left without an aggregate are adopted by a new one, and
//!   aggregates left without constituents are removed
//!
//! Persistence is delegated to a [`Journal`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{
    ChangeNotification, ContactStore, EventSink, Filter, Relationship, RelationshipKind,
    RequestKind, SortOrder, StoreEvent, StoreRequest,
};
use crate::contact::{Contact, ContactId, FetchHint, SyncTarget};
use crate::error::{StoreError, StoreResult};
use crate::phone;

/// Id of the device owner's contact. Always present, always an aggregate.
pub const SELF_CONTACT_ID: ContactId = 1;

const RESULT_BATCH: usize = 50;
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Everything a journal persisted, as loaded at startup.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub contacts: Vec<Contact>,
    pub relationships: Vec<Relationship>,
}

/// One mutation's worth of writes.
#[derive(Debug, Default)]
pub struct JournalBatch<'a> {
    pub written: Vec<&'a Contact>,
    pub removed: &'a [ContactId],
    pub linked: &'a [Relationship],
    pub unlinked: &'a [Relationship],
}

impl JournalBatch<'_> {
    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
            && self.removed.is_empty()
            && self.linked.is_empty()
            && self.unlinked.is_empty()
    }
}

/// Persistence backend of a [`LocalStore`].
pub trait Journal: Send + 'static {
    fn load(&mut self) -> StoreResult<Snapshot>;

    fn persist(&mut self, batch: &JournalBatch<'_>) -> StoreResult<()>;
}

/// Keeps nothing.
#[derive(Debug, Default)]
pub struct MemoryJournal;

impl Journal for MemoryJournal {
    fn load(&mut self) -> StoreResult<Snapshot> {
        Ok(Snapshot::default())
    }

    fn persist(&mut self, _batch: &JournalBatch<'_>) -> StoreResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalStoreOptions {
    /// Region used to canonicalize phone numbers written without a country
    /// code. Numbers that cannot be parsed are stored as given.
    pub phone_region: Option<String>,
}

/// Bookkeeping for a single mutation.
#[derive(Debug, Default)]
struct Changes {
    added: Vec<ContactId>,
    changed: Vec<ContactId>,
    removed: Vec<ContactId>,
    linked: Vec<Relationship>,
    unlinked: Vec<Relationship>,
}

impl Changes {
    fn touch(&mut self, id: ContactId) {
        if !self.added.contains(&id) && !self.changed.contains(&id) {
            self.changed.push(id);
        }
    }

    fn notifications(&self) -> Vec<ChangeNotification> {
        let removed: HashSet<ContactId> = self.removed.iter().copied().collect();
        let added: Vec<ContactId> = self
            .added
            .iter()
            .copied()
            .filter(|id| !removed.contains(id))
            .collect();
        let changed: Vec<ContactId> = self
            .changed
            .iter()
            .copied()
            .filter(|id| !removed.contains(id) && !added.contains(id))
            .collect();

        let mut notifications = Vec::new();
        if !added.is_empty() {
            notifications.push(ChangeNotification::Added(added));
        }
        if !changed.is_empty() {
            notifications.push(ChangeNotification::Changed(changed));
        }
        if !self.removed.is_empty() {
            notifications.push(ChangeNotification::Removed(self.removed.clone()));
        }
        notifications
    }
}

struct Book<J> {
    journal: J,
    contacts: BTreeMap<ContactId, Contact>,
    relationships: Vec<Relationship>,
    next_id: ContactId,
    phone_region: Option<String>,
    request_counts: HashMap<RequestKind, usize>,
    failures: HashSet<RequestKind>,
}

impl<J: Journal> Book<J> {
    fn open(mut journal: J, options: LocalStoreOptions) -> StoreResult<Self> {
        let snapshot = journal.load()?;
        Ok(Self::from_snapshot(journal, snapshot, options))
    }

    fn from_snapshot(journal: J, snapshot: Snapshot, options: LocalStoreOptions) -> Self {
        let mut contacts: BTreeMap<ContactId, Contact> = snapshot
            .contacts
            .into_iter()
            .map(|contact| (contact.id, contact))
            .collect();
        contacts.entry(SELF_CONTACT_ID).or_insert_with(|| Contact {
            id: SELF_CONTACT_ID,
            sync_target: Some(SyncTarget::Aggregate),
            ..Default::default()
        });

        let next_id = contacts.keys().next_back().copied().unwrap_or(SELF_CONTACT_ID) + 1;
        debug!(count = contacts.len(), "local store opened");

        Self {
            journal,
            contacts,
            relationships: snapshot.relationships,
            next_id,
            phone_region: options.phone_region,
            request_counts: HashMap::new(),
            failures: HashSet::new(),
        }
    }

    /// Run one request to completion, returning the change notifications to
    /// broadcast once the requester has seen `Finished`.
    fn execute(&mut self, request: StoreRequest, sink: &EventSink) -> Vec<ChangeNotification> {
        let kind = request.kind();
        *self.request_counts.entry(kind).or_default() += 1;

        if self.failures.remove(&kind) {
            sink.emit(StoreEvent::Finished(Err(StoreError::Backend(format!(
                "injected failure for {kind:?}"
            )))));
            return Vec::new();
        }

        let outcome = match request {
            StoreRequest::Fetch { filter, sort, hint } => {
                let contacts = self.query(&filter, &sort);
                let projected: Vec<Contact> =
                    contacts.into_iter().map(|contact| project(contact, hint)).collect();
                for batch in projected.chunks(RESULT_BATCH) {
                    sink.emit(StoreEvent::Contacts(batch.to_vec()));
                }
                Ok(Changes::default())
            }
            StoreRequest::FetchById { ids, hint } => {
                let found: Vec<Contact> = ids
                    .iter()
                    .filter_map(|id| self.contacts.get(id))
                    .map(|contact| project(contact, hint))
                    .collect();
                for batch in found.chunks(RESULT_BATCH) {
                    sink.emit(StoreEvent::Contacts(batch.to_vec()));
                }
                Ok(Changes::default())
            }
            StoreRequest::QueryIds { filter, sort } => {
                let ids: Vec<ContactId> = self
                    .query(&filter, &sort)
                    .into_iter()
                    .map(|contact| contact.id)
                    .collect();
                for batch in ids.chunks(RESULT_BATCH) {
                    sink.emit(StoreEvent::Ids(batch.to_vec()));
                }
                Ok(Changes::default())
            }
            StoreRequest::FetchRelationships { first, kind } => {
                let found: Vec<Relationship> = self
                    .relationships
                    .iter()
                    .filter(|rel| rel.first == first && rel.kind == kind)
                    .copied()
                    .collect();
                if !found.is_empty() {
                    sink.emit(StoreEvent::Relationships(found));
                }
                Ok(Changes::default())
            }
            StoreRequest::Save(contacts) => self.save(contacts).map(|(changes, _)| changes),
            StoreRequest::Remove(ids) => self.remove(&ids),
            StoreRequest::SaveRelationships(relationships) => self.link(&relationships),
            StoreRequest::RemoveRelationships(relationships) => Ok(self.unlink(&relationships)),
        };

        match outcome.and_then(|changes| self.persist(&changes).map(|_| changes)) {
            Ok(changes) => {
                sink.emit(StoreEvent::Finished(Ok(())));
                changes.notifications()
            }
            Err(err) => {
                warn!(error = %err, ?kind, "local store request failed");
                sink.emit(StoreEvent::Finished(Err(err)));
                Vec::new()
            }
        }
    }

    fn query(&self, filter: &Filter, sort: &SortOrder) -> Vec<&Contact> {
        let mut matched: Vec<&Contact> = self
            .contacts
            .values()
            .filter(|contact| filter.matches(contact))
            .collect();
        matched.sort_by(|a, b| sort.compare(a, b));
        matched
    }

    fn persist(&mut self, changes: &Changes) -> StoreResult<()> {
        let written: Vec<&Contact> = changes
            .added
            .iter()
            .chain(changes.changed.iter())
            .filter_map(|id| self.contacts.get(id))
            .collect();
        let batch = JournalBatch {
            written,
            removed: &changes.removed,
            linked: &changes.linked,
            unlinked: &changes.unlinked,
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.journal.persist(&batch)
    }

    fn allocate_id(&mut self) -> ContactId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn aggregates_of(&self, id: ContactId) -> Vec<ContactId> {
        self.relationships
            .iter()
            .filter(|rel| rel.kind == RelationshipKind::Aggregates && rel.second == id)
            .map(|rel| rel.first)
            .collect()
    }

    fn constituents_of(&self, id: ContactId) -> Vec<ContactId> {
        self.relationships
            .iter()
            .filter(|rel| rel.kind == RelationshipKind::Aggregates && rel.first == id)
            .map(|rel| rel.second)
            .collect()
    }

    fn canonicalize_phones(&self, contact: &mut Contact) {
        for number in &mut contact.phone_numbers {
            if let Some(canonical) = phone::canonicalize(number, self.phone_region.as_deref()) {
                *number = canonical;
            }
        }
    }

    /// Returns the changes plus, per input contact, the id consumers see
    /// (the new aggregate for created contacts).
    fn save(&mut self, contacts: Vec<Contact>) -> StoreResult<(Changes, Vec<ContactId>)> {
        if let Some(missing) = contacts
            .iter()
            .find(|contact| contact.id != 0 && !self.contacts.contains_key(&contact.id))
        {
            return Err(StoreError::Backend(format!(
                "cannot save contact {}: it does not exist",
                missing.id
            )));
        }

        let mut changes = Changes::default();
        let mut ids = Vec::with_capacity(contacts.len());
        for mut contact in contacts {
            self.canonicalize_phones(&mut contact);
            let is_aggregate = self
                .contacts
                .get(&contact.id)
                .is_some_and(Contact::is_aggregate);
            let id = if contact.id == 0 {
                self.create(contact, &mut changes)
            } else if is_aggregate {
                self.update_aggregate(contact, &mut changes)
            } else {
                self.update_constituent(contact, &mut changes)
            };
            ids.push(id);
        }
        self.settle(&mut changes);
        Ok((changes, ids))
    }

    fn create(&mut self, mut contact: Contact, changes: &mut Changes) -> ContactId {
        let id = self.allocate_id();
        contact.id = id;
        if contact.is_top_level() {
            contact.sync_target = Some(SyncTarget::Local);
        }
        self.contacts.insert(id, contact);
        changes.added.push(id);
        self.adopt(id, changes)
    }

    /// Give a constituent a new aggregate of its own.
    fn adopt(&mut self, constituent: ContactId, changes: &mut Changes) -> ContactId {
        let aggregate = self.allocate_id();
        self.contacts.insert(
            aggregate,
            Contact {
                id: aggregate,
                sync_target: Some(SyncTarget::Aggregate),
                ..Default::default()
            },
        );
        changes.added.push(aggregate);

        let rel = Relationship::aggregates(aggregate, constituent);
        self.relationships.push(rel);
        changes.linked.push(rel);
        self.rebuild_aggregate(aggregate, changes);
        aggregate
    }

    fn update_aggregate(&mut self, contact: Contact, changes: &mut Changes) -> ContactId {
        let aggregate = contact.id;
        let local = self.constituents_of(aggregate).into_iter().find(|id| {
            self.contacts
                .get(id)
                .is_some_and(|c| c.sync_target == Some(SyncTarget::Local))
        });

        let local = match local {
            Some(id) => id,
            None => {
                let id = self.allocate_id();
                let rel = Relationship::aggregates(aggregate, id);
                self.relationships.push(rel);
                changes.linked.push(rel);
                changes.added.push(id);
                id
            }
        };

        let mut details = contact;
        details.id = local;
        details.sync_target = Some(SyncTarget::Local);
        self.contacts.insert(local, details);
        changes.touch(local);
        self.rebuild_aggregate(aggregate, changes);
        aggregate
    }

    fn update_constituent(&mut self, contact: Contact, changes: &mut Changes) -> ContactId {
        let id = contact.id;
        self.contacts.insert(id, contact);
        changes.touch(id);
        for aggregate in self.aggregates_of(id) {
            self.rebuild_aggregate(aggregate, changes);
        }
        id
    }

    fn remove(&mut self, ids: &[ContactId]) -> StoreResult<Changes> {
        if ids.contains(&SELF_CONTACT_ID) {
            return Err(StoreError::Backend("the self contact cannot be removed".to_string()));
        }
        if let Some(missing) = ids.iter().find(|id| !self.contacts.contains_key(id)) {
            return Err(StoreError::Backend(format!(
                "cannot remove contact {missing}: it does not exist"
            )));
        }

        let mut doomed: Vec<ContactId> = Vec::new();
        for &id in ids {
            if !doomed.contains(&id) {
                doomed.push(id);
            }
            if self.contacts.get(&id).is_some_and(Contact::is_aggregate) {
                for constituent in self.constituents_of(id) {
                    let shared = self
                        .aggregates_of(constituent)
                        .iter()
                        .any(|other| !ids.contains(other));
                    if !shared && !doomed.contains(&constituent) {
                        doomed.push(constituent);
                    }
                }
            }
        }

        let mut changes = Changes::default();
        let mut affected: Vec<ContactId> = Vec::new();
        for id in &doomed {
            affected.extend(self.aggregates_of(*id));
            self.drop_contact(*id, &mut changes);
        }
        for aggregate in affected {
            if self.contacts.contains_key(&aggregate) {
                self.rebuild_aggregate(aggregate, &mut changes);
            }
        }
        self.settle(&mut changes);
        Ok(changes)
    }

    fn drop_contact(&mut self, id: ContactId, changes: &mut Changes) {
        if self.contacts.remove(&id).is_none() {
            return;
        }
        changes.removed.push(id);
        let (dropped, kept): (Vec<Relationship>, Vec<Relationship>) = self
            .relationships
            .drain(..)
            .partition(|rel| rel.first == id || rel.second == id);
        self.relationships = kept;
        changes.unlinked.extend(dropped);
    }

    fn link(&mut self, relationships: &[Relationship]) -> StoreResult<Changes> {
        if let Some(rel) = relationships.iter().find(|rel| {
            !self.contacts.contains_key(&rel.first) || !self.contacts.contains_key(&rel.second)
        }) {
            return Err(StoreError::Backend(format!(
                "cannot relate {} and {}: contact does not exist",
                rel.first, rel.second
            )));
        }

        let mut changes = Changes::default();
        for rel in relationships {
            if self.relationships.contains(rel) {
                continue;
            }
            self.relationships.push(*rel);
            changes.linked.push(*rel);
            if rel.kind == RelationshipKind::Aggregates {
                self.rebuild_aggregate(rel.first, &mut changes);
            }
        }
        self.settle(&mut changes);
        Ok(changes)
    }

    fn unlink(&mut self, relationships: &[Relationship]) -> Changes {
        let mut changes = Changes::default();
        for rel in relationships {
            let Some(pos) = self.relationships.iter().position(|existing| existing == rel) else {
                continue;
            };
            self.relationships.remove(pos);
            changes.unlinked.push(*rel);
            if rel.kind == RelationshipKind::Aggregates && self.contacts.contains_key(&rel.first) {
                self.rebuild_aggregate(rel.first, &mut changes);
            }
        }
        self.settle(&mut changes);
        changes
    }

    /// Adopt orphaned constituents, then drop empty aggregates.
    fn settle(&mut self, changes: &mut Changes) {
        let orphans: Vec<ContactId> = self
            .contacts
            .values()
            .filter(|contact| !contact.is_aggregate() && self.aggregates_of(contact.id).is_empty())
            .map(|contact| contact.id)
            .collect();
        for orphan in orphans {
            self.adopt(orphan, changes);
        }

        let empty: Vec<ContactId> = self
            .contacts
            .values()
            .filter(|contact| {
                contact.is_aggregate()
                    && contact.id != SELF_CONTACT_ID
                    && self.constituents_of(contact.id).is_empty()
            })
            .map(|contact| contact.id)
            .collect();
        for aggregate in empty {
            self.drop_contact(aggregate, changes);
        }
    }

    /// Recompute an aggregate as the union of its constituents.
    fn rebuild_aggregate(&mut self, aggregate: ContactId, changes: &mut Changes) {
        let mut constituents: Vec<&Contact> = self
            .constituents_of(aggregate)
            .iter()
            .filter_map(|id| self.contacts.get(id))
            .collect();
        if constituents.is_empty() {
            return;
        }
        constituents.sort_by_key(|c| (c.sync_target != Some(SyncTarget::Local), c.id));

        let local = constituents
            .iter()
            .find(|c| c.sync_target == Some(SyncTarget::Local));

        let mut merged = Contact {
            id: aggregate,
            sync_target: Some(SyncTarget::Aggregate),
            ..Default::default()
        };
        merged.name = constituents
            .iter()
            .map(|c| &c.name)
            .find(|name| !name.is_empty())
            .cloned()
            .unwrap_or_default();
        merged.display_label = first_non_empty(constituents.iter().map(|c| &c.display_label));
        merged.organization = first_non_empty(constituents.iter().map(|c| &c.organization));
        merged.favorite = match local {
            Some(local) => local.favorite,
            None => constituents.iter().any(|c| c.favorite),
        };
        merged.presence = constituents
            .iter()
            .map(|c| &c.presence)
            .min_by_key(|presence| (!presence.state.is_online(), presence.state))
            .cloned()
            .unwrap_or_default();
        for c in &constituents {
            extend_unique(&mut merged.nicknames, &c.nicknames);
            extend_unique(&mut merged.phone_numbers, &c.phone_numbers);
            extend_unique(&mut merged.email_addresses, &c.email_addresses);
            extend_unique(&mut merged.online_accounts, &c.online_accounts);
            extend_unique(&mut merged.avatars, &c.avatars);
        }

        if self.contacts.get(&aggregate) != Some(&merged) {
            self.contacts.insert(aggregate, merged);
            changes.touch(aggregate);
        }
    }
}

fn project(contact: &Contact, hint: FetchHint) -> Contact {
    if hint.is_full() {
        contact.clone()
    } else {
        contact.project(hint.detail_types())
    }
}

fn first_non_empty<'a>(mut values: impl Iterator<Item = &'a String>) -> String {
    values.find(|value| !value.is_empty()).cloned().unwrap_or_default()
}

fn extend_unique<T: Clone + PartialEq>(target: &mut Vec<T>, values: &[T]) {
    for value in values {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

type Submission = (StoreRequest, EventSink);

/// In-process [`ContactStore`].
///
/// Must be created from within a Tokio runtime: the worker task is spawned
/// on construction.
pub struct LocalStore<J: Journal = MemoryJournal> {
    book: Arc<Mutex<Book<J>>>,
    requests: mpsc::UnboundedSender<Submission>,
    changes: broadcast::Sender<ChangeNotification>,
}

impl LocalStore<MemoryJournal> {
    pub fn in_memory() -> Self {
        Self::spawn(Book::from_snapshot(
            MemoryJournal,
            Snapshot::default(),
            LocalStoreOptions::default(),
        ))
    }
}

impl<J: Journal> LocalStore<J> {
    pub fn open(journal: J, options: LocalStoreOptions) -> StoreResult<Self> {
        Ok(Self::spawn(Book::open(journal, options)?))
    }

    fn spawn(book: Book<J>) -> Self {
        let book = Arc::new(Mutex::new(book));
        let (requests, mut rx) = mpsc::unbounded_channel::<Submission>();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let worker_book = Arc::clone(&book);
        let worker_changes = changes.clone();
        tokio::spawn(async move {
            while let Some((request, sink)) = rx.recv().await {
                let notifications = worker_book.lock().execute(request, &sink);
                for notification in notifications {
                    let _ = worker_changes.send(notification);
                }
                tokio::task::yield_now().await;
            }
        });

        Self {
            book,
            requests,
            changes,
        }
    }

    fn broadcast(&self, notifications: Vec<ChangeNotification>) {
        for notification in notifications {
            let _ = self.changes.send(notification);
        }
    }

    /// Save synchronously, bypassing the request queue. Returns the
    /// top-level id of every saved contact.
    pub fn save_now(&self, contacts: Vec<Contact>) -> StoreResult<Vec<ContactId>> {
        let mut book = self.book.lock();
        let (changes, ids) = book.save(contacts)?;
        book.persist(&changes)?;
        drop(book);
        self.broadcast(changes.notifications());
        Ok(ids)
    }

    /// Remove synchronously, bypassing the request queue.
    pub fn remove_now(&self, ids: &[ContactId]) -> StoreResult<()> {
        let mut book = self.book.lock();
        let changes = book.remove(ids)?;
        book.persist(&changes)?;
        drop(book);
        self.broadcast(changes.notifications());
        Ok(())
    }

    pub fn contact(&self, id: ContactId) -> Option<Contact> {
        self.book.lock().contacts.get(&id).cloned()
    }

    pub fn contacts(&self, filter: &Filter, sort: &SortOrder) -> Vec<Contact> {
        self.book
            .lock()
            .query(filter, sort)
            .into_iter()
            .cloned()
            .collect()
    }

    /// The first aggregate the contact belongs to. Aggregates map to
    /// themselves.
    pub fn aggregate_of(&self, id: ContactId) -> Option<ContactId> {
        let book = self.book.lock();
        match book.contacts.get(&id) {
            Some(contact) if contact.is_aggregate() => Some(id),
            Some(_) => book.aggregates_of(id).first().copied(),
            None => None,
        }
    }

    pub fn constituents_of(&self, aggregate: ContactId) -> Vec<ContactId> {
        self.book.lock().constituents_of(aggregate)
    }

    /// Number of requests of this kind executed so far.
    pub fn request_count(&self, kind: RequestKind) -> usize {
        self.book
            .lock()
            .request_counts
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Make the next request of this kind fail.
    pub fn fail_next(&self, kind: RequestKind) {
        self.book.lock().failures.insert(kind);
    }
}

impl<J: Journal> ContactStore for LocalStore<J> {
    fn start(&self, request: StoreRequest, sink: EventSink) {
        if let Err(mpsc::error::SendError((_, sink))) = self.requests.send((request, sink)) {
            sink.emit(StoreEvent::Finished(Err(StoreError::Closed)));
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    fn self_contact_id(&self) -> ContactId {
        SELF_CONTACT_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Name;
    use crate::store::SortField;
    use pretty_assertions::assert_eq;

    fn local(first: &str, last: &str) -> Contact {
        Contact::new(first, last)
    }

    #[tokio::test]
    async fn test_new_contact_gets_an_aggregate() {
        let store = LocalStore::in_memory();
        let ids = store.save_now(vec![local("Alfred", "Alfredson")]).unwrap();

        let aggregate = ids[0];
        let contact = store.contact(aggregate).unwrap();
        assert!(contact.is_aggregate());
        assert_eq!(contact.name, Name::new("Alfred", "Alfredson"));

        let constituents = store.constituents_of(aggregate);
        assert_eq!(constituents.len(), 1);
        assert_eq!(
            store.contact(constituents[0]).unwrap().sync_target,
            Some(SyncTarget::Local)
        );
    }

    #[tokio::test]
    async fn test_saving_aggregate_updates_local_constituent() {
        let store = LocalStore::in_memory();
        let aggregate = store.save_now(vec![local("Carlo", "Carloson")]).unwrap()[0];

        let mut contact = store.contact(aggregate).unwrap();
        contact.phone_numbers.push("+358470009955".to_string());
        store.save_now(vec![contact]).unwrap();

        let constituent = store.constituents_of(aggregate)[0];
        assert_eq!(
            store.contact(constituent).unwrap().phone_numbers,
            vec!["+358470009955".to_string()]
        );
        assert_eq!(
            store.contact(aggregate).unwrap().phone_numbers,
            vec!["+358470009955".to_string()]
        );
    }

    #[tokio::test]
    async fn test_relinking_constituents_removes_empty_aggregate() {
        let store = LocalStore::in_memory();
        let ids = store
            .save_now(vec![local("Daffy", "Duck"), local("Dafferd", "Duck")])
            .unwrap();
        let (a, b) = (ids[0], ids[1]);
        let moved = store.constituents_of(b)[0];

        let mut book = store.book.lock();
        book.link(&[Relationship::aggregates(a, moved)]).unwrap();
        let changes = book.unlink(&[Relationship::aggregates(b, moved)]);
        drop(book);

        assert_eq!(changes.removed, vec![b]);
        assert_eq!(store.constituents_of(a).len(), 2);
        assert!(store.contact(b).is_none());
    }

    #[tokio::test]
    async fn test_orphaned_constituent_is_adopted() {
        let store = LocalStore::in_memory();
        let ids = store
            .save_now(vec![local("Daffy", "Duck"), local("Dafferd", "Duck")])
            .unwrap();
        let (a, b) = (ids[0], ids[1]);
        let moved = store.constituents_of(b)[0];
        {
            let mut book = store.book.lock();
            book.link(&[Relationship::aggregates(a, moved)]).unwrap();
            book.unlink(&[Relationship::aggregates(b, moved)]);
            book.unlink(&[Relationship::aggregates(a, moved)]);
        }

        let adopted = store.aggregate_of(moved).unwrap();
        assert_ne!(adopted, a);
        assert_eq!(store.contact(adopted).unwrap().name.first, "Dafferd");
        assert_eq!(store.constituents_of(a).len(), 1);
    }

    #[tokio::test]
    async fn test_remove_aggregate_removes_constituents() {
        let store = LocalStore::in_memory();
        let aggregate = store.save_now(vec![local("Ernest", "Everest")]).unwrap()[0];
        let constituent = store.constituents_of(aggregate)[0];

        store.remove_now(&[aggregate]).unwrap();

        assert!(store.contact(aggregate).is_none());
        assert!(store.contact(constituent).is_none());
        assert!(store.remove_now(&[SELF_CONTACT_ID]).is_err());
    }

    #[tokio::test]
    async fn test_requests_stream_results_and_notify_after_finish() {
        let store = LocalStore::in_memory();
        let mut changes = store.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut contact = local("Berta", "Bertason");
        contact.favorite = true;
        store.start(StoreRequest::Save(vec![contact]), EventSink::new(1, tx.clone()));
        store.start(
            StoreRequest::Fetch {
                filter: Filter::aggregates().and(Filter::Favorite(true)),
                sort: SortOrder::new([SortField::FirstName]),
                hint: FetchHint::FULL,
            },
            EventSink::new(2, tx),
        );

        let saved = rx.recv().await.unwrap();
        assert_eq!(saved.request, 1);
        assert!(matches!(saved.event, StoreEvent::Finished(Ok(()))));

        let fetched = rx.recv().await.unwrap();
        match fetched.event {
            StoreEvent::Contacts(contacts) => {
                assert_eq!(contacts.len(), 1);
                assert_eq!(contacts[0].name.first, "Berta");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap().event,
            StoreEvent::Finished(Ok(()))
        ));

        assert!(matches!(changes.recv().await.unwrap(), ChangeNotification::Added(ids) if ids.len() == 2));
        assert_eq!(store.request_count(RequestKind::Fetch), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_finishes_with_error() {
        let store = LocalStore::in_memory();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.fail_next(RequestKind::QueryIds);
        store.start(
            StoreRequest::QueryIds {
                filter: Filter::All,
                sort: SortOrder::default(),
            },
            EventSink::new(9, tx),
        );

        let message = rx.recv().await.unwrap();
        assert!(matches!(message.event, StoreEvent::Finished(Err(_))));
    }

    #[tokio::test]
    async fn test_phone_numbers_are_canonicalized_with_region() {
        let store = LocalStore::open(
            MemoryJournal,
            LocalStoreOptions {
                phone_region: Some("FI".to_string()),
            },
        )
        .unwrap();
        let mut contact = local("Daffy", "Duck");
        contact.phone_numbers.push("0470009955".to_string());
        contact.phone_numbers.push("not a number".to_string());
        let aggregate = store.save_now(vec![contact]).unwrap()[0];

        assert_eq!(
            store.contact(aggregate).unwrap().phone_numbers,
            vec!["+358470009955".to_string(), "not a number".to_string()]
        );
    }
}
