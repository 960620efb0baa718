//! The cache engine.
//!
//! All cache state lives in [`Engine`]: the identity store, the address and
//! name-group indexes, the three views and the queues feeding the request
//! scheduler. The engine never blocks and never calls consumer code while it
//! is borrowed; callbacks are queued as notices that the owner delivers after
//! releasing the lock.
//!
//! Scheduling follows a fixed priority ladder evaluated once per wake. Each
//! rung starts at most one store request, and only for a request kind that
//! is idle. Completion of a request wakes the ladder again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::address::{addresses_of, Address, AddressIndex, AddressKey, PendingResolution};
use super::aggregation::{plan_merge, plan_split, LinkQueue};
use super::debounce::Debouncer;
use super::groups::{default_groups, determine_group, NameGroupIndex};
use super::item::{CacheItem, CachedContact, ContactState};
use super::listeners::{
    ChangeListener, ItemData, ItemListener, NameGroupListener, NameGrouper, Registry,
    ResolveListener, Subscription, ViewListener,
};
use super::view::{synchronize, ListEdit, View, ViewState};
use crate::config::CacheConfig;
use crate::contact::{Contact, ContactId, FetchHint, FetchTypes};
use crate::error::StoreResult;
use crate::label::{self, DisplayLabelOrder, NameProperty};
use crate::store::{
    ChangeNotification, ContactStore, DetailField, EventSink, Filter, MatchMode, Relationship,
    RelationshipKind, RequestId, RequestKind, SortField, SortOrder, StoreEvent, StoreMessage,
    StoreRequest,
};

/// A consumer callback waiting for the engine lock to be released.
pub(crate) type Notice = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Population {
    Unpopulated,
    Fetching(View),
    Populated,
}

/// What a running request was started for.
enum Purpose {
    Populate(View),
    Refetch { favorites: bool },
    Changed {
        ids: Vec<ContactId>,
        returned: HashSet<ContactId>,
    },
    Resolve { found: Option<ContactId> },
    Relationships {
        anchor: ContactId,
        found: Vec<ContactId>,
    },
    Constituents {
        anchor: ContactId,
        ids: Vec<ContactId>,
    },
    MergeCandidates {
        anchor: ContactId,
        found: Vec<ContactId>,
    },
    Sync { view: View, ids: Vec<ContactId> },
    Save,
    Remove,
    Link(Vec<Relationship>),
}

struct InFlight {
    id: RequestId,
    hint: FetchHint,
    purpose: Purpose,
}

/// A queued address resolution and everyone waiting for it.
struct ResolveRequest {
    address: Address,
    key: AddressKey,
    /// Listener and its `require_complete` flag, one entry per call.
    waiters: Vec<(Subscription, bool)>,
}

impl ResolveRequest {
    fn require_complete(&self) -> bool {
        self.waiters.iter().any(|(_, require_complete)| *require_complete)
    }
}

/// Outcome of asking for a complete item.
pub(crate) enum Completion {
    Ready(Option<CachedContact>),
    Pending(oneshot::Receiver<Option<CachedContact>>),
}

pub(crate) struct Engine {
    generation: u64,
    store: Arc<dyn ContactStore>,
    events: mpsc::UnboundedSender<StoreMessage>,
    config: CacheConfig,
    self_id: ContactId,
    next_request: RequestId,

    // =========================================================================
    // Identity store, indexes and views
    // =========================================================================
    items: HashMap<ContactId, CacheItem>,
    views: [ViewState; 3],
    view_listeners: [Registry<dyn ViewListener>; 3],
    view_subscriptions: HashMap<Subscription, View>,
    /// All-view insertions minus removals since the last idle pass.
    expired: HashMap<ContactId, i32>,
    addresses: AddressIndex,
    unknown: Vec<PendingResolution>,
    groups: NameGroupIndex,
    grouper: Option<Arc<dyn NameGrouper>>,
    known_groups: Vec<String>,

    // =========================================================================
    // Listeners
    // =========================================================================
    change_listeners: Registry<dyn ChangeListener>,
    resolve_listeners: Registry<dyn ResolveListener>,
    group_listeners: Registry<dyn NameGroupListener>,
    item_listener_owners: HashMap<Subscription, ContactId>,
    users: HashSet<Subscription>,

    // =========================================================================
    // Work queues
    // =========================================================================
    relationships_to_save: Vec<Relationship>,
    relationships_to_remove: Vec<Relationship>,
    contacts_to_remove: Vec<ContactId>,
    contacts_to_save: Vec<Contact>,
    contacts_to_create: Vec<Contact>,
    /// Aggregates whose constituent ids are being or will be fetched.
    constituent_anchors: VecDeque<ContactId>,
    /// Aggregates whose constituent records are being or will be fetched.
    constituent_details: VecDeque<(ContactId, Vec<ContactId>)>,
    merge_candidates: VecDeque<ContactId>,
    links: LinkQueue,
    /// Changed ids waiting for the debounce timer.
    changed: Vec<ContactId>,
    contacts_updated: bool,
    debounce: Debouncer,
    /// Ids to fetch in full as soon as the fetch request is idle.
    fetch_queue: Vec<ContactId>,
    resolve_queue: VecDeque<ResolveRequest>,

    population: Population,
    keep_populated: bool,
    fetch_types: FetchTypes,
    fetch_types_changed: bool,
    refresh_required: bool,

    active: HashMap<RequestKind, InFlight>,
    update_requested: bool,
    completions: HashMap<ContactId, Vec<oneshot::Sender<Option<CachedContact>>>>,
    expiry: Option<Instant>,
    phase_started: Instant,

    // Batched notifications, flushed after each processed event.
    changed_keys: HashSet<AddressKey>,
    modified_groups: HashSet<String>,
    outbox: Vec<Notice>,
}

impl Engine {
    pub fn new(
        generation: u64,
        store: Arc<dyn ContactStore>,
        events: mpsc::UnboundedSender<StoreMessage>,
        config: CacheConfig,
    ) -> Self {
        let self_id = store.self_contact_id();
        Self {
            generation,
            store,
            events,
            self_id,
            next_request: 0,
            items: HashMap::new(),
            views: Default::default(),
            view_listeners: Default::default(),
            view_subscriptions: HashMap::new(),
            expired: HashMap::new(),
            addresses: AddressIndex::new(config.phone_match_digits),
            unknown: Vec::new(),
            groups: NameGroupIndex::default(),
            grouper: None,
            known_groups: default_groups(),
            change_listeners: Registry::default(),
            resolve_listeners: Registry::default(),
            group_listeners: Registry::default(),
            item_listener_owners: HashMap::new(),
            users: HashSet::new(),
            relationships_to_save: Vec::new(),
            relationships_to_remove: Vec::new(),
            contacts_to_remove: Vec::new(),
            contacts_to_save: Vec::new(),
            contacts_to_create: Vec::new(),
            constituent_anchors: VecDeque::new(),
            constituent_details: VecDeque::new(),
            merge_candidates: VecDeque::new(),
            links: LinkQueue::default(),
            changed: Vec::new(),
            contacts_updated: false,
            debounce: Debouncer::new(config.change_quiet, config.change_max_wait),
            fetch_queue: Vec::new(),
            resolve_queue: VecDeque::new(),
            population: Population::Unpopulated,
            keep_populated: false,
            fetch_types: FetchTypes::empty(),
            fetch_types_changed: false,
            refresh_required: false,
            active: HashMap::new(),
            update_requested: false,
            completions: HashMap::new(),
            expiry: None,
            phase_started: Instant::now(),
            changed_keys: HashSet::new(),
            modified_groups: HashSet::new(),
            outbox: Vec::new(),
            config,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn take_outbox(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.outbox)
    }

    /// Earliest timer the driver must wake up for.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.debounce.deadline(), self.expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn request_update(&mut self) {
        self.update_requested = true;
    }

    fn is_active(&self, kind: RequestKind) -> bool {
        self.active.contains_key(&kind)
    }

    // =========================================================================
    // Dispatch ladder
    // =========================================================================

    /// Run one step of the dispatch ladder if an update was requested.
    pub fn step(&mut self) {
        if !std::mem::take(&mut self.update_requested) {
            return;
        }

        let started = self.start_relationship_changes()
            || self.start_removals()
            || self.start_saves()
            || self.start_constituent_fetch()
            || self.start_relationship_fetch()
            || self.start_merge_candidate_query()
            || self.start_population()
            || self.start_refetch()
            || self.start_changed_fetch()
            || self.start_resolution()
            || self.start_resync();

        if !started {
            self.purge_expired();
        }
    }

    fn start(&mut self, request: StoreRequest, hint: FetchHint, purpose: Purpose) {
        let kind = request.kind();
        self.next_request += 1;
        let id = self.next_request;
        debug!(request = id, ?kind, "starting store request");

        self.active.insert(kind, InFlight { id, hint, purpose });
        self.store
            .start(request, EventSink::new(id, self.events.clone()));
    }

    fn start_relationship_changes(&mut self) -> bool {
        let mut started = false;
        if !self.relationships_to_save.is_empty() && !self.is_active(RequestKind::SaveRelationships)
        {
            let relationships = std::mem::take(&mut self.relationships_to_save);
            self.start(
                StoreRequest::SaveRelationships(relationships.clone()),
                FetchHint::FULL,
                Purpose::Link(relationships),
            );
            started = true;
        }
        if !self.relationships_to_remove.is_empty()
            && !self.is_active(RequestKind::RemoveRelationships)
        {
            let relationships = std::mem::take(&mut self.relationships_to_remove);
            self.start(
                StoreRequest::RemoveRelationships(relationships.clone()),
                FetchHint::FULL,
                Purpose::Link(relationships),
            );
            started = true;
        }
        started
    }

    fn start_removals(&mut self) -> bool {
        if self.contacts_to_remove.is_empty() || self.is_active(RequestKind::Remove) {
            return false;
        }
        let ids = std::mem::take(&mut self.contacts_to_remove);
        self.start(StoreRequest::Remove(ids), FetchHint::FULL, Purpose::Remove);
        true
    }

    fn start_saves(&mut self) -> bool {
        if (self.contacts_to_create.is_empty() && self.contacts_to_save.is_empty())
            || self.is_active(RequestKind::Save)
        {
            return false;
        }
        let mut contacts = std::mem::take(&mut self.contacts_to_create);
        contacts.append(&mut self.contacts_to_save);
        self.start(StoreRequest::Save(contacts), FetchHint::FULL, Purpose::Save);
        true
    }

    fn start_constituent_fetch(&mut self) -> bool {
        if self.is_active(RequestKind::FetchById) {
            return false;
        }
        let Some((anchor, ids)) = self.constituent_details.front().cloned() else {
            return false;
        };
        self.start(
            StoreRequest::FetchById {
                ids: ids.clone(),
                hint: FetchHint::FULL,
            },
            FetchHint::FULL,
            Purpose::Constituents { anchor, ids },
        );
        true
    }

    fn start_relationship_fetch(&mut self) -> bool {
        if self.is_active(RequestKind::FetchRelationships) {
            return false;
        }
        let Some(&anchor) = self.constituent_anchors.front() else {
            return false;
        };
        self.start(
            StoreRequest::FetchRelationships {
                first: anchor,
                kind: RelationshipKind::Aggregates,
            },
            FetchHint::FULL,
            Purpose::Relationships {
                anchor,
                found: Vec::new(),
            },
        );
        true
    }

    fn start_merge_candidate_query(&mut self) -> bool {
        if self.is_active(RequestKind::QueryIds) {
            return false;
        }
        let Some(&anchor) = self.merge_candidates.front() else {
            return false;
        };
        let filter = match self.items.get(&anchor) {
            Some(item) => merge_candidate_filter(
                &item.contact,
                &item.display_label,
                self.addresses.match_digits(),
            ),
            None => Filter::Or(Vec::new()).and(Filter::aggregates()),
        };
        self.start(
            StoreRequest::QueryIds {
                filter,
                sort: self.sort_order(),
            },
            FetchHint::FULL,
            Purpose::MergeCandidates {
                anchor,
                found: Vec::new(),
            },
        );
        true
    }

    fn start_population(&mut self) -> bool {
        if !self.keep_populated
            || self.population != Population::Unpopulated
            || self.is_active(RequestKind::Fetch)
        {
            return false;
        }
        self.phase_started = Instant::now();
        self.start_population_phase(View::Favorites);
        true
    }

    fn start_population_phase(&mut self, view: View) {
        let types = self.fetch_types;
        let (filter, sort, hint) = match view {
            View::Favorites => (
                Filter::Favorite(true).and(Filter::aggregates()),
                self.sort_order(),
                FetchHint::favorites(types),
            ),
            View::All => {
                self.fetch_types_changed = false;
                (Filter::aggregates(), self.sort_order(), FetchHint::metadata(types))
            }
            View::Online => (
                Filter::Online.and(Filter::aggregates()),
                self.online_sort_order(),
                FetchHint::online(types),
            ),
        };
        self.population = Population::Fetching(view);
        self.start(
            StoreRequest::Fetch { filter, sort, hint },
            hint,
            Purpose::Populate(view),
        );
    }

    fn start_refetch(&mut self) -> bool {
        if self.population != Population::Populated
            || !self.fetch_types_changed
            || self.is_active(RequestKind::Fetch)
        {
            return false;
        }
        self.fetch_types_changed = false;
        self.start_refetch_phase(true);
        true
    }

    fn start_refetch_phase(&mut self, favorites: bool) {
        let (filter, hint) = if favorites {
            (
                Filter::Favorite(true).and(Filter::aggregates()),
                FetchHint::favorites(self.fetch_types),
            )
        } else {
            (
                Filter::Favorite(false).and(Filter::aggregates()),
                FetchHint::online(self.fetch_types),
            )
        };
        let sort = self.sort_order();
        self.start(
            StoreRequest::Fetch { filter, sort, hint },
            hint,
            Purpose::Refetch { favorites },
        );
    }

    fn start_changed_fetch(&mut self) -> bool {
        if self.fetch_queue.is_empty() || self.is_active(RequestKind::Fetch) {
            return false;
        }
        let mut seen = HashSet::new();
        let ids: Vec<ContactId> = std::mem::take(&mut self.fetch_queue)
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();

        let filter = Filter::Ids(ids.clone()).and(Filter::aggregates());
        self.start(
            StoreRequest::Fetch {
                filter,
                sort: self.sort_order(),
                hint: FetchHint::FULL,
            },
            FetchHint::FULL,
            Purpose::Changed {
                ids,
                returned: HashSet::new(),
            },
        );
        true
    }

    fn start_resolution(&mut self) -> bool {
        if self.is_active(RequestKind::Fetch) {
            return false;
        }
        let Some(request) = self.resolve_queue.front() else {
            return false;
        };

        let filter = match &request.address {
            Address::Phone(number) => Filter::PhoneNumber {
                number: number.clone(),
                significant_digits: self.addresses.match_digits(),
            },
            Address::Email(email) => {
                Filter::detail(DetailField::EmailAddress, email.trim(), MatchMode::Exactly)
            }
            Address::Account { path, uri } => Filter::And(vec![
                Filter::Detail {
                    field: DetailField::AccountPath,
                    value: path.clone(),
                    mode: MatchMode::Exactly,
                    case_sensitive: true,
                },
                Filter::detail(DetailField::AccountUri, uri.trim(), MatchMode::Exactly),
            ]),
        }
        .and(Filter::aggregates());

        // Without completion, fetch at least what favorites hold so a
        // favorite is never replaced with fewer details, plus the kind being
        // resolved so the result gets indexed.
        let hint = if request.require_complete() {
            FetchHint::FULL
        } else {
            let resolved_kind = match &request.address {
                Address::Phone(_) => FetchTypes::PHONE_NUMBER,
                Address::Email(_) => FetchTypes::EMAIL_ADDRESS,
                Address::Account { .. } => FetchTypes::ACCOUNT_URI,
            };
            FetchHint::favorites(self.fetch_types | resolved_kind)
        };
        debug!(key = ?request.key, "resolving address");
        self.start(
            StoreRequest::Fetch {
                filter,
                sort: self.sort_order(),
                hint,
            },
            hint,
            Purpose::Resolve { found: None },
        );
        true
    }

    fn start_resync(&mut self) -> bool {
        if !self.refresh_required
            || self.population != Population::Populated
            || self.is_active(RequestKind::QueryIds)
        {
            return false;
        }
        self.refresh_required = false;
        self.start_sync(View::Favorites);
        true
    }

    fn start_sync(&mut self, view: View) {
        let (filter, sort) = self.view_query(view);
        self.start(
            StoreRequest::QueryIds { filter, sort },
            FetchHint::FULL,
            Purpose::Sync {
                view,
                ids: Vec::new(),
            },
        );
    }

    fn view_query(&self, view: View) -> (Filter, SortOrder) {
        match view {
            View::Favorites => (
                Filter::Favorite(true).and(Filter::aggregates()),
                self.sort_order(),
            ),
            View::All => (Filter::aggregates(), self.sort_order()),
            View::Online => (
                Filter::Online.and(Filter::aggregates()),
                self.online_sort_order(),
            ),
        }
    }

    fn sort_order(&self) -> SortOrder {
        match self.config.sort_property {
            NameProperty::FirstName => SortOrder::new([SortField::FirstName, SortField::LastName]),
            NameProperty::LastName => SortOrder::new([SortField::LastName, SortField::FirstName]),
        }
    }

    fn online_sort_order(&self) -> SortOrder {
        let mut fields = vec![SortField::PresenceState];
        fields.extend(self.sort_order().fields);
        SortOrder::new(fields)
    }

    // =========================================================================
    // Store events
    // =========================================================================

    pub fn handle_store_message(&mut self, message: StoreMessage) {
        let Some(kind) = self
            .active
            .iter()
            .find(|(_, flight)| flight.id == message.request)
            .map(|(kind, _)| *kind)
        else {
            debug!(request = message.request, "ignoring event of an unknown request");
            return;
        };
        let Some(mut flight) = self.active.remove(&kind) else {
            return;
        };

        match message.event {
            StoreEvent::Contacts(contacts) => {
                self.contacts_available(&mut flight, contacts);
                self.active.insert(kind, flight);
            }
            StoreEvent::Ids(ids) => {
                match &mut flight.purpose {
                    Purpose::Sync { ids: found, .. } | Purpose::MergeCandidates { found, .. } => {
                        found.extend(ids)
                    }
                    _ => warn!(?kind, "unexpected id results"),
                }
                self.active.insert(kind, flight);
            }
            StoreEvent::Relationships(relationships) => {
                if let Purpose::Relationships { found, .. } = &mut flight.purpose {
                    for relationship in relationships {
                        if relationship.kind == RelationshipKind::Aggregates
                            && !found.contains(&relationship.second)
                        {
                            found.push(relationship.second);
                        }
                    }
                }
                self.active.insert(kind, flight);
            }
            StoreEvent::Finished(result) => {
                self.request_finished(kind, flight, result);
                self.request_update();
            }
        }
        self.flush_batch();
    }

    fn contacts_available(&mut self, flight: &mut InFlight, contacts: Vec<Contact>) {
        let hint = flight.hint;
        match &mut flight.purpose {
            Purpose::Populate(view) => self.append_populated(*view, contacts, hint),
            Purpose::Changed { returned, .. } => {
                for contact in contacts {
                    returned.insert(contact.id);
                    self.apply_fetched(contact, hint);
                }
            }
            Purpose::Resolve { found } => {
                for contact in contacts {
                    found.get_or_insert(contact.id);
                    self.apply_fetched(contact, hint);
                }
            }
            _ => {
                for contact in contacts {
                    self.apply_fetched(contact, hint);
                }
            }
        }
    }

    fn request_finished(&mut self, kind: RequestKind, flight: InFlight, result: StoreResult<()>) {
        let failed = match result {
            Ok(()) => false,
            Err(err) => {
                warn!(error = %err, ?kind, "store request failed");
                true
            }
        };

        match flight.purpose {
            Purpose::Populate(view) => self.population_phase_finished(view),
            Purpose::Refetch { favorites } => {
                if favorites {
                    self.start_refetch_phase(false);
                }
            }
            Purpose::Changed { ids, returned } => {
                for id in ids.into_iter().filter(|id| !returned.contains(id)) {
                    self.fetch_missed(id);
                }
            }
            Purpose::Resolve { found } => self.resolve_finished(found),
            Purpose::Relationships { anchor, found } => {
                self.constituent_anchors.pop_front();
                if failed || found.is_empty() {
                    self.constituents_known(anchor, Vec::new());
                } else {
                    self.constituent_details.push_back((anchor, found));
                }
            }
            Purpose::Constituents { anchor, ids } => {
                self.constituent_details.pop_front();
                let ids = if failed { Vec::new() } else { ids };
                self.constituents_known(anchor, ids);
            }
            Purpose::MergeCandidates { anchor, found } => {
                self.merge_candidates.pop_front();
                let mut seen = HashSet::new();
                let candidates: Vec<ContactId> = found
                    .into_iter()
                    .filter(|id| *id != anchor && seen.insert(*id))
                    .collect();
                if let Some(data) = self.items.get(&anchor).and_then(|item| item.data.clone()) {
                    self.outbox
                        .push(Box::new(move || data.merge_candidates_fetched(&candidates)));
                }
            }
            Purpose::Sync { view, ids } => {
                if !failed {
                    self.synchronize_view(view, ids);
                }
                match view {
                    View::Favorites => self.start_sync(View::All),
                    View::All => self.start_sync(View::Online),
                    View::Online => {}
                }
            }
            Purpose::Save | Purpose::Remove => {}
            Purpose::Link(relationships) => self.aggregation_completed(&relationships),
        }
    }

    fn population_phase_finished(&mut self, view: View) {
        self.views[view.index()].populated = true;
        self.notify_view(view, move |listener| listener.populated(view));
        debug!(
            ?view,
            elapsed_ms = self.phase_started.elapsed().as_millis() as u64,
            "view populated"
        );

        match view {
            View::Favorites => self.start_population_phase(View::All),
            View::All => self.start_population_phase(View::Online),
            View::Online => self.population = Population::Populated,
        }
    }

    fn append_populated(&mut self, view: View, contacts: Vec<Contact>, hint: FetchHint) {
        let mut appended: Vec<ContactId> = Vec::new();
        for contact in contacts {
            let id = contact.id;
            let top_level = contact.is_top_level();
            self.apply_fetched(contact, hint);

            if id != self.self_id
                && top_level
                && !appended.contains(&id)
                && !self.views[view.index()].contains(id)
            {
                appended.push(id);
            }
        }
        if appended.is_empty() {
            return;
        }

        let begin = self.views[view.index()].len();
        self.apply_edit(
            view,
            ListEdit::Insert {
                index: begin,
                ids: appended,
            },
            false,
        );
    }

    /// Fold a fetched record into its cache item and every index.
    fn apply_fetched(&mut self, mut contact: Contact, hint: FetchHint) {
        let id = contact.id;
        if id == 0 {
            return;
        }
        let digits = self.addresses.match_digits();
        let partial = !hint.is_full();

        let item = self.items.entry(id).or_insert_with(|| CacheItem::new(id));
        let previous = std::mem::take(&mut item.contact);
        if partial {
            contact.merge_unfetched(&previous, hint.detail_types());
        }

        let old_addresses = if previous.is_top_level() {
            addresses_of(&previous, digits)
        } else {
            Vec::new()
        };
        let new_addresses = if contact.is_top_level() {
            addresses_of(&contact, digits)
        } else {
            Vec::new()
        };

        let mut data_changed = contact != previous;
        item.contact = contact;
        item.advance_state(partial);
        let label = label::generate_display_label(&item.contact, self.config.display_label_order);
        if label != item.display_label {
            item.display_label = label;
            data_changed = true;
        }
        let complete = item.state == ContactState::Complete;

        let added = self
            .addresses
            .update(id, &old_addresses, &new_addresses, &mut self.changed_keys);
        self.regroup(id);
        self.resolve_unknown(id, &added);

        if data_changed {
            self.report_data_changed(id);
        }
        self.report_item_updated(id);
        if complete {
            self.complete_waiters(id);
        }
    }

    /// Satisfy pending resolutions for keys `id` just gained.
    fn resolve_unknown(&mut self, id: ContactId, added: &[AddressKey]) {
        if added.is_empty() || self.unknown.is_empty() {
            return;
        }
        let (matched, rest): (Vec<PendingResolution>, Vec<PendingResolution>) =
            std::mem::take(&mut self.unknown)
                .into_iter()
                .partition(|pending| added.contains(&pending.key));
        self.unknown = rest;

        for pending in matched {
            if pending.require_complete {
                self.ensure_completion(id);
            }
            let Some(snapshot) = self.items.get(&id).map(CacheItem::snapshot) else {
                continue;
            };
            if let Some(listener) = self.resolve_listeners.get(pending.listener) {
                debug!(key = ?pending.key, id, "pending address resolved");
                let address = pending.address;
                self.outbox.push(Box::new(move || {
                    listener.address_resolved(&address, Some(&snapshot))
                }));
            }
        }
    }

    fn resolve_finished(&mut self, found: Option<ContactId>) {
        let Some(request) = self.resolve_queue.pop_front() else {
            return;
        };

        let snapshot = match found {
            Some(id) => {
                if request.require_complete() {
                    self.ensure_completion(id);
                }
                self.items.get(&id).map(CacheItem::snapshot)
            }
            None => {
                for (listener, require_complete) in &request.waiters {
                    self.unknown.push(PendingResolution {
                        address: request.address.clone(),
                        key: request.key.clone(),
                        listener: *listener,
                        require_complete: *require_complete,
                    });
                }
                None
            }
        };
        debug!(key = ?request.key, found = snapshot.is_some(), "address resolution finished");

        let listeners: Vec<Arc<dyn ResolveListener>> = request
            .waiters
            .iter()
            .filter_map(|(subscription, _)| self.resolve_listeners.get(*subscription))
            .collect();
        if listeners.is_empty() {
            return;
        }
        let address = request.address;
        self.outbox.push(Box::new(move || {
            for listener in &listeners {
                listener.address_resolved(&address, snapshot.as_ref());
            }
        }));
    }

    /// A requested id did not come back from its fetch.
    fn fetch_missed(&mut self, id: ContactId) {
        if let Some(item) = self.items.get_mut(&id) {
            if item.state == ContactState::Requested {
                item.state = ContactState::Absent;
            }
        }
        if let Some(waiters) = self.completions.remove(&id) {
            for waiter in waiters {
                let _ = waiter.send(None);
            }
        }
    }

    fn complete_waiters(&mut self, id: ContactId) {
        let Some(waiters) = self.completions.remove(&id) else {
            return;
        };
        let snapshot = self.items.get(&id).map(CacheItem::snapshot);
        for waiter in waiters {
            let _ = waiter.send(snapshot.clone());
        }
    }

    // =========================================================================
    // Change notifications and timers
    // =========================================================================

    pub fn handle_change(&mut self, notification: ChangeNotification) {
        match notification {
            ChangeNotification::Added(ids) => {
                if self.keep_populated {
                    self.update_contacts(ids);
                }
            }
            ChangeNotification::Changed(ids) => {
                let ids = if self.keep_populated {
                    ids
                } else {
                    ids.into_iter()
                        .filter(|id| self.items.contains_key(id))
                        .collect()
                };
                self.update_contacts(ids);
            }
            ChangeNotification::Removed(ids) => self.contacts_removed(&ids),
            ChangeNotification::DataChanged => self.update_all_contacts(),
        }
        self.flush_batch();
    }

    /// The change stream dropped notifications; re-read everything.
    pub fn handle_lagged(&mut self, skipped: u64) {
        warn!(skipped, "change notifications lagged; refreshing all cached contacts");
        self.update_all_contacts();
    }

    fn update_all_contacts(&mut self) {
        let ids: Vec<ContactId> = self
            .items
            .values()
            .filter(|item| item.state != ContactState::Absent)
            .map(CacheItem::id)
            .collect();
        self.update_contacts(ids);
    }

    fn update_contacts(&mut self, ids: Vec<ContactId>) {
        if ids.is_empty() {
            return;
        }
        self.contacts_updated = true;
        self.changed.extend(ids);
        self.debounce.poke(Instant::now());
    }

    fn contacts_removed(&mut self, ids: &[ContactId]) {
        let digits = self.addresses.match_digits();
        let change_listeners = self.change_listeners.snapshot();

        for &id in ids {
            let Some(item) = self.items.get_mut(&id) else {
                continue;
            };

            let item_listeners = std::mem::take(&mut item.listeners).snapshot();
            if !item_listeners.is_empty() || !change_listeners.is_empty() {
                let change_listeners = change_listeners.clone();
                self.outbox.push(Box::new(move || {
                    for listener in &change_listeners {
                        listener.item_about_to_be_removed(id);
                    }
                    for listener in &item_listeners {
                        listener.item_about_to_be_removed(id);
                    }
                }));
            }

            let addresses = if item.contact.is_top_level() {
                addresses_of(&item.contact, digits)
            } else {
                Vec::new()
            };
            let group = std::mem::take(&mut item.name_group);
            item.contact = Contact {
                id,
                ..Default::default()
            };
            item.state = ContactState::Absent;

            self.item_listener_owners.retain(|_, owner| *owner != id);
            self.addresses.remove(id, &addresses, &mut self.changed_keys);
            self.groups.remove(id, &group, &mut self.modified_groups);
            self.fetch_missed(id);

            if !self.keep_populated {
                *self.expired.entry(id).or_default() -= 1;
            }
        }

        if self.keep_populated {
            self.refresh_required = true;
        }
        self.request_update();
    }

    /// Fire due timers. Returns true when the engine has expired and should
    /// be dropped.
    pub fn on_timer(&mut self) -> bool {
        let now = Instant::now();
        if self.debounce.is_due(now) {
            self.flush_changes(now);
        }
        self.expiry.is_some_and(|deadline| deadline <= now)
    }

    fn flush_changes(&mut self, now: Instant) {
        if self.is_active(RequestKind::Fetch) {
            // Keep accumulating until the running fetch is done.
            self.debounce.retry(now, self.config.fetch_retry);
            return;
        }
        self.debounce.reset();
        self.fetch_queue.append(&mut self.changed);
        if std::mem::take(&mut self.contacts_updated) && self.keep_populated {
            self.refresh_required = true;
        }
        self.request_update();
    }

    fn purge_expired(&mut self) {
        if self.expired.is_empty() {
            return;
        }
        let digits = self.addresses.match_digits();
        for (id, count) in std::mem::take(&mut self.expired) {
            if count >= 0 {
                continue;
            }
            let Some(item) = self.items.remove(&id) else {
                continue;
            };
            let addresses = if item.contact.is_top_level() {
                addresses_of(&item.contact, digits)
            } else {
                Vec::new()
            };
            self.addresses.remove(id, &addresses, &mut self.changed_keys);
            self.groups
                .remove(id, &item.name_group, &mut self.modified_groups);
            self.item_listener_owners.retain(|_, owner| *owner != id);
            self.fetch_missed(id);
            debug!(id, "purged expired contact");
        }
        self.flush_batch();
    }

    // =========================================================================
    // Views
    // =========================================================================

    fn synchronize_view(&mut self, view: View, query: Vec<ContactId>) {
        let query: Vec<ContactId> = query
            .into_iter()
            .filter(|id| *id != self.self_id)
            .collect();
        let edits = synchronize(self.views[view.index()].ids(), &query);
        debug!(?view, edits = edits.len(), "synchronized view");

        for edit in edits {
            self.apply_edit(view, edit, true);
        }
        self.notify_view(view, move |listener| listener.items_changed(view));
    }

    /// Apply one structural edit, bracketed by listener notifications.
    fn apply_edit(&mut self, view: View, edit: ListEdit, track_expiry: bool) {
        let rows = edit.rows();
        let track_expiry = track_expiry && view == View::All;

        match &edit {
            ListEdit::Remove { index, count } => {
                let about = rows.clone();
                self.notify_view(view, move |listener| {
                    listener.about_to_remove(view, about.clone())
                });
                if track_expiry {
                    for id in &self.views[view.index()].ids()[*index..*index + *count] {
                        *self.expired.entry(*id).or_default() -= 1;
                    }
                }
                self.views[view.index()].apply(&edit);
                self.notify_view(view, move |listener| listener.removed(view, rows.clone()));
            }
            ListEdit::Insert { ids, .. } => {
                let about = rows.clone();
                self.notify_view(view, move |listener| {
                    listener.about_to_insert(view, about.clone())
                });
                for &id in ids {
                    if track_expiry {
                        *self.expired.entry(id).or_default() += 1;
                    }
                    if !self.items.contains_key(&id) {
                        self.items.insert(id, CacheItem::new(id));
                        self.refresh(id);
                    }
                }
                let inserted = ids.clone();
                self.views[view.index()].apply(&edit);
                self.notify_view(view, move |listener| {
                    listener.inserted(view, rows.clone(), &inserted)
                });
            }
        }
    }

    fn notify_view(&mut self, view: View, notify: impl Fn(&dyn ViewListener) + Send + 'static) {
        let listeners = self.view_listeners[view.index()].snapshot();
        if listeners.is_empty() {
            return;
        }
        self.outbox.push(Box::new(move || {
            for listener in &listeners {
                notify(listener.as_ref());
            }
        }));
    }

    fn notify_all_views(&mut self, notify: impl Fn(&dyn ViewListener, View) + Send + Sync + 'static) {
        let notify = Arc::new(notify);
        for view in View::ALL {
            let notify = Arc::clone(&notify);
            self.notify_view(view, move |listener| notify(listener, view));
        }
    }

    fn report_data_changed(&mut self, id: ContactId) {
        for view in View::ALL {
            if let Some(row) = self.views[view.index()].index_of(id) {
                self.notify_view(view, move |listener| listener.data_changed(view, row));
            }
        }
    }

    fn report_item_updated(&mut self, id: ContactId) {
        let Some(item) = self.items.get(&id) else {
            return;
        };
        let item_listeners = item.listeners.snapshot();
        let change_listeners = self.change_listeners.snapshot();
        let data = item.data.clone();
        if item_listeners.is_empty() && change_listeners.is_empty() && data.is_none() {
            return;
        }

        let snapshot = item.snapshot();
        self.outbox.push(Box::new(move || {
            for listener in &item_listeners {
                listener.item_updated(&snapshot);
            }
            for listener in &change_listeners {
                listener.item_updated(&snapshot);
            }
            if let Some(data) = &data {
                data.contact_updated(&snapshot);
            }
        }));
    }

    /// Emit the notifications batched while processing one event.
    fn flush_batch(&mut self) {
        if !self.changed_keys.is_empty() {
            let keys = std::mem::take(&mut self.changed_keys);
            let listeners = self.change_listeners.snapshot();
            if !listeners.is_empty() {
                debug!(count = keys.len(), "address resolutions changed");
                self.outbox.push(Box::new(move || {
                    for listener in &listeners {
                        listener.address_resolutions_changed(&keys);
                    }
                }));
            }
        }

        if !self.modified_groups.is_empty() {
            let groups = std::mem::take(&mut self.modified_groups);
            let listeners = self.group_listeners.snapshot();
            if !listeners.is_empty() {
                let updates = self.groups.updates(&groups);
                self.outbox.push(Box::new(move || {
                    for listener in &listeners {
                        listener.name_groups_updated(&updates);
                    }
                }));
            }
        }
    }

    pub fn contacts(&self, view: View) -> Vec<ContactId> {
        self.views[view.index()].ids().to_vec()
    }

    pub fn contact_index(&mut self, view: View, id: ContactId) -> Option<usize> {
        self.views[view.index()].index_of(id)
    }

    pub fn is_populated(&self, view: View) -> bool {
        self.views[view.index()].populated
    }

    pub fn register_view(
        &mut self,
        view: View,
        listener: Arc<dyn ViewListener>,
        fetch_types: FetchTypes,
    ) -> Subscription {
        let subscription = self.view_listeners[view.index()].add(listener);
        self.view_subscriptions.insert(subscription, view);
        self.expiry = None;
        self.keep_populated(fetch_types);
        subscription
    }

    pub fn unregister_view(&mut self, subscription: Subscription) {
        if let Some(view) = self.view_subscriptions.remove(&subscription) {
            self.view_listeners[view.index()].remove(subscription);
        }
        self.check_expiry();
    }

    fn keep_populated(&mut self, fetch_types: FetchTypes) {
        if !self.keep_populated {
            self.keep_populated = true;
            self.fetch_types = fetch_types;
            self.request_update();
        } else if !self.fetch_types.contains(fetch_types) {
            self.fetch_types |= fetch_types;
            self.fetch_types_changed = true;
            self.request_update();
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn register_user(&mut self) -> Subscription {
        let subscription = Subscription::next();
        self.users.insert(subscription);
        self.expiry = None;
        subscription
    }

    pub fn unregister_user(&mut self, subscription: Subscription) {
        self.users.remove(&subscription);
        self.check_expiry();
    }

    fn check_expiry(&mut self) {
        let unused = self.users.is_empty()
            && self
                .view_listeners
                .iter()
                .all(|registry| registry.is_empty());
        if unused && self.expiry.is_none() {
            debug!(grace = ?self.config.expiry_grace, "cache unused; arming expiry");
            self.expiry = Some(Instant::now() + self.config.expiry_grace);
        }
    }

    // =========================================================================
    // Item access
    // =========================================================================

    pub fn item_by_id(&mut self, id: ContactId, require_complete: bool) -> Option<CachedContact> {
        if id == 0 {
            return None;
        }
        self.items.entry(id).or_insert_with(|| CacheItem::new(id));
        if require_complete {
            self.ensure_completion(id);
        }
        self.items.get(&id).map(CacheItem::snapshot)
    }

    pub fn existing_item(&self, id: ContactId) -> Option<CachedContact> {
        self.items.get(&id).map(CacheItem::snapshot)
    }

    pub fn item_by_address(
        &mut self,
        address: &Address,
        require_complete: bool,
    ) -> Option<CachedContact> {
        let id = self.addresses.lookup(address)?;
        self.item_by_id(id, require_complete)
    }

    /// Queue a full fetch unless the item is complete or already requested.
    fn ensure_completion(&mut self, id: ContactId) {
        let state = self
            .items
            .get(&id)
            .map_or(ContactState::Absent, |item| item.state);
        if matches!(state, ContactState::Absent | ContactState::Partial) {
            self.refresh(id);
        }
    }

    fn refresh(&mut self, id: ContactId) {
        let item = self.items.entry(id).or_insert_with(|| CacheItem::new(id));
        item.state = ContactState::Requested;
        self.fetch_queue.push(id);
        self.request_update();
    }

    pub fn refresh_contact(&mut self, id: ContactId) -> bool {
        if id == 0 {
            return false;
        }
        self.refresh(id);
        true
    }

    pub fn await_completion(&mut self, id: ContactId) -> Completion {
        if id == 0 {
            return Completion::Ready(None);
        }
        if let Some(item) = self.items.get(&id) {
            if item.state == ContactState::Complete {
                return Completion::Ready(Some(item.snapshot()));
            }
        }
        self.item_by_id(id, true);
        let (tx, rx) = oneshot::channel();
        self.completions.entry(id).or_default().push(tx);
        Completion::Pending(rx)
    }

    // =========================================================================
    // Address resolution
    // =========================================================================

    pub fn register_resolve_listener(&mut self, listener: Arc<dyn ResolveListener>) -> Subscription {
        self.resolve_listeners.add(listener)
    }

    pub fn unregister_resolve_listener(&mut self, subscription: Subscription) {
        self.resolve_listeners.remove(subscription);
        for request in &mut self.resolve_queue {
            request.waiters.retain(|(listener, _)| *listener != subscription);
        }
        // The head may be in flight; its completion pops it.
        let in_flight = self.is_active(RequestKind::Fetch)
            && self
                .active
                .get(&RequestKind::Fetch)
                .is_some_and(|flight| matches!(flight.purpose, Purpose::Resolve { .. }));
        let mut index = 0;
        self.resolve_queue.retain(|request| {
            let keep = (in_flight && index == 0) || !request.waiters.is_empty();
            index += 1;
            keep
        });
        self.unknown
            .retain(|pending| pending.listener != subscription);
    }

    /// Look `address` up; queue a store query when it is not indexed.
    pub fn resolve(
        &mut self,
        listener: Subscription,
        address: Address,
        require_complete: bool,
    ) -> Option<CachedContact> {
        if let Some(item) = self.item_by_address(&address, require_complete) {
            return Some(item);
        }

        let Some(key) = address.key(self.addresses.match_digits()) else {
            debug!(?address, "ignoring unresolvable address");
            return None;
        };
        if !self.resolve_listeners.contains(listener) {
            warn!(?listener, "resolve requested for an unregistered listener");
            return None;
        }

        match self.resolve_queue.iter_mut().find(|request| request.key == key) {
            Some(request) => request.waiters.push((listener, require_complete)),
            None => self.resolve_queue.push_back(ResolveRequest {
                address,
                key,
                waiters: vec![(listener, require_complete)],
            }),
        }
        self.request_update();
        None
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub fn save_contact(&mut self, contact: Contact) {
        let id = contact.id;
        if id == 0 {
            self.contacts_to_create.push(contact);
        } else {
            match self.contacts_to_save.iter_mut().find(|queued| queued.id == id) {
                Some(queued) => *queued = contact,
                None => self.contacts_to_save.push(contact),
            }
            self.report_data_changed(id);
        }
        self.request_update();
    }

    pub fn remove_contact(&mut self, id: ContactId) -> bool {
        if id == 0 {
            return false;
        }
        self.contacts_to_remove.push(id);

        for view in View::ALL {
            if let Some(index) = self.views[view.index()].index_of(id) {
                self.apply_edit(view, ListEdit::Remove { index, count: 1 }, true);
            }
        }
        if let Some(item) = self.items.get_mut(&id) {
            let group = std::mem::take(&mut item.name_group);
            self.groups.remove(id, &group, &mut self.modified_groups);
        }
        self.flush_batch();
        self.request_update();
        true
    }

    pub fn aggregate_contacts(&mut self, target: ContactId, source: ContactId) -> bool {
        if target == 0 || source == 0 || target == source {
            return false;
        }
        debug!(target, source, "aggregation requested");
        self.links.push(target, source);
        self.fetch_constituents(target);
        self.fetch_constituents(source);
        true
    }

    pub fn disaggregate_contacts(&mut self, aggregate: ContactId, constituent: ContactId) -> bool {
        if aggregate == 0 || constituent == 0 {
            return false;
        }
        let plan = plan_split(
            aggregate,
            constituent,
            self.items.get(&constituent).map(|item| &item.contact),
        );
        self.relationships_to_remove.extend(plan.unlink);
        self.relationships_to_save.extend(plan.link);
        if let Some(restored) = plan.restore {
            self.save_contact(restored);
        }
        self.request_update();
        true
    }

    pub fn fetch_constituents(&mut self, id: ContactId) -> bool {
        if id == 0 {
            return false;
        }
        let queued = self.constituent_anchors.contains(&id)
            || self
                .constituent_details
                .iter()
                .any(|(anchor, _)| *anchor == id);
        if !queued {
            self.constituent_anchors.push_back(id);
            self.request_update();
        }
        true
    }

    pub fn fetch_merge_candidates(&mut self, id: ContactId) -> bool {
        if id == 0 {
            return false;
        }
        if !self.merge_candidates.contains(&id) {
            self.merge_candidates.push_back(id);
            self.request_update();
        }
        true
    }

    fn constituents_known(&mut self, anchor: ContactId, ids: Vec<ContactId>) {
        let item = self
            .items
            .entry(anchor)
            .or_insert_with(|| CacheItem::new(anchor));
        item.constituents = Some(ids.clone());
        if let Some(data) = item.data.clone() {
            self.outbox
                .push(Box::new(move || data.constituents_fetched(&ids)));
        }

        for request in self.links.constituents_known(anchor) {
            self.complete_aggregation(request.target, request.source);
        }
    }

    fn constituent_contacts(&self, aggregate: ContactId) -> Vec<Contact> {
        self.items
            .get(&aggregate)
            .and_then(|item| item.constituents.as_ref())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.items.get(id))
                    .map(|item| item.contact.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn complete_aggregation(&mut self, target: ContactId, source: ContactId) {
        let plan = plan_merge(
            target,
            &self.constituent_contacts(target),
            source,
            &self.constituent_contacts(source),
        );
        debug!(
            target,
            source,
            moved = plan.link.len(),
            demoted = plan.demote.is_some(),
            "merging aggregates"
        );
        if let Some(demoted) = plan.demote {
            self.save_contact(demoted);
        }
        self.relationships_to_save.extend(plan.link);
        self.relationships_to_remove.extend(plan.unlink);
        self.request_update();
    }

    fn aggregation_completed(&mut self, relationships: &[Relationship]) {
        let mut firsts: Vec<ContactId> = Vec::new();
        for relationship in relationships {
            if !firsts.contains(&relationship.first) {
                firsts.push(relationship.first);
            }
        }
        let data: Vec<Arc<dyn ItemData>> = firsts
            .iter()
            .filter_map(|id| self.items.get(id).and_then(|item| item.data.clone()))
            .collect();
        if data.is_empty() {
            return;
        }
        self.outbox.push(Box::new(move || {
            for data in &data {
                data.aggregation_operation_completed();
            }
        }));
    }

    // =========================================================================
    // Listeners and item data
    // =========================================================================

    pub fn register_change_listener(&mut self, listener: Arc<dyn ChangeListener>) -> Subscription {
        self.change_listeners.add(listener)
    }

    pub fn unregister_change_listener(&mut self, subscription: Subscription) {
        self.change_listeners.remove(subscription);
    }

    pub fn register_item_listener(
        &mut self,
        id: ContactId,
        listener: Arc<dyn ItemListener>,
    ) -> Option<Subscription> {
        if id == 0 {
            return None;
        }
        let item = self.items.entry(id).or_insert_with(|| CacheItem::new(id));
        let subscription = item.listeners.add(listener);
        self.item_listener_owners.insert(subscription, id);
        Some(subscription)
    }

    pub fn unregister_item_listener(&mut self, subscription: Subscription) {
        if let Some(id) = self.item_listener_owners.remove(&subscription) {
            if let Some(item) = self.items.get_mut(&id) {
                item.listeners.remove(subscription);
            }
        }
    }

    pub fn attach_item_data(&mut self, id: ContactId, data: Arc<dyn ItemData>) -> bool {
        if id == 0 {
            return false;
        }
        let item = self.items.entry(id).or_insert_with(|| CacheItem::new(id));
        item.data = Some(data);
        true
    }

    pub fn detach_item_data(&mut self, id: ContactId) -> Option<Arc<dyn ItemData>> {
        self.items.get_mut(&id).and_then(|item| item.data.take())
    }

    // =========================================================================
    // Name groups
    // =========================================================================

    /// Recompute the name group of one item, moving its membership.
    fn regroup(&mut self, id: ContactId) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        let group = if id == self.self_id
            || item.state == ContactState::Absent
            || !item.contact.is_top_level()
        {
            String::new()
        } else {
            determine_group(
                &item.contact,
                &item.display_label,
                self.config.group_property,
                self.grouper.as_deref(),
                &self.known_groups,
            )
        };
        if group == item.name_group {
            return;
        }
        let old = std::mem::replace(&mut item.name_group, group);
        self.groups.remove(id, &old, &mut self.modified_groups);
        self.groups
            .add(id, &item.name_group, &mut self.modified_groups);
    }

    fn regroup_all(&mut self) {
        let ids: Vec<ContactId> = self.items.keys().copied().collect();
        for id in ids {
            self.regroup(id);
        }
        self.flush_batch();
    }

    pub fn name_group(&self, id: ContactId) -> Option<String> {
        self.items
            .get(&id)
            .map(|item| item.name_group.clone())
            .filter(|group| !group.is_empty())
    }

    pub fn all_name_groups(&self) -> Vec<String> {
        self.known_groups.clone()
    }

    pub fn name_group_members(&self, group: &str) -> HashSet<ContactId> {
        self.groups.members_of(group)
    }

    pub fn name_groups(&self) -> HashMap<String, HashSet<ContactId>> {
        self.groups.members()
    }

    pub fn register_name_group_listener(
        &mut self,
        listener: Arc<dyn NameGroupListener>,
    ) -> Subscription {
        self.group_listeners.add(listener)
    }

    pub fn unregister_name_group_listener(&mut self, subscription: Subscription) {
        self.group_listeners.remove(subscription);
    }

    pub fn set_name_grouper(&mut self, grouper: Option<Arc<dyn NameGrouper>>) {
        self.known_groups = grouper
            .as_ref()
            .map(|grouper| grouper.all_groups())
            .filter(|groups| !groups.is_empty())
            .unwrap_or_else(default_groups);
        self.grouper = grouper;
        self.regroup_all();
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    pub fn set_display_label_order(&mut self, order: DisplayLabelOrder) {
        if order == self.config.display_label_order {
            return;
        }
        self.config.display_label_order = order;

        let ids: Vec<ContactId> = self.items.keys().copied().collect();
        for id in ids {
            let Some(item) = self.items.get_mut(&id) else {
                continue;
            };
            let label = label::generate_display_label(&item.contact, order);
            let relabeled = item.state != ContactState::Absent && label != item.display_label;
            if relabeled {
                item.display_label = label;
            }
            if let Some(data) = item.data.clone() {
                self.outbox
                    .push(Box::new(move || data.display_label_order_changed(order)));
            }
            if relabeled {
                self.report_data_changed(id);
                self.report_item_updated(id);
            }
            self.regroup(id);
        }
        self.flush_batch();

        self.notify_all_views(move |listener, view| {
            listener.display_label_order_changed(order);
            listener.items_changed(view);
        });
    }

    pub fn set_sort_property(&mut self, property: NameProperty) {
        if property == self.config.sort_property {
            return;
        }
        self.config.sort_property = property;
        self.notify_all_views(move |listener, _| listener.sort_property_changed(property));
        self.refresh_required = true;
        self.request_update();
    }

    pub fn set_group_property(&mut self, property: NameProperty) {
        if property == self.config.group_property {
            return;
        }
        self.config.group_property = property;
        self.regroup_all();
        self.notify_all_views(move |listener, _| listener.group_property_changed(property));
    }
}

/// Id query for aggregates that look like the same person as `contact`.
fn merge_candidate_filter(contact: &Contact, label: &str, match_digits: usize) -> Filter {
    let contains =
        |field: DetailField, value: &str| Filter::detail(field, value, MatchMode::Contains);
    let mut clauses = Vec::new();

    if contact.name.is_empty() {
        let label = if contact.display_label.is_empty() {
            label
        } else {
            contact.display_label.as_str()
        };
        if !label.is_empty() {
            clauses.push(contains(DetailField::FirstName, label));
            clauses.push(contains(DetailField::LastName, label));
            clauses.push(contains(DetailField::Nickname, label));
        }
    } else {
        if !contact.name.first.is_empty() {
            clauses.push(contains(DetailField::FirstName, &contact.name.first));
            clauses.push(contains(DetailField::Nickname, &contact.name.first));
        }
        if !contact.name.last.is_empty() {
            clauses.push(contains(DetailField::LastName, &contact.name.last));
            clauses.push(contains(DetailField::Nickname, &contact.name.last));
        }
    }

    for number in &contact.phone_numbers {
        clauses.push(Filter::PhoneNumber {
            number: number.clone(),
            significant_digits: match_digits,
        });
    }

    // Addresses match on the part before `@`.
    let local_part = |field: DetailField, value: &str| match value.find('@') {
        Some(index) if index > 0 => Filter::detail(field, &value[..index], MatchMode::StartsWith),
        _ => Filter::detail(field, value, MatchMode::Exactly),
    };
    for email in &contact.email_addresses {
        clauses.push(local_part(DetailField::EmailAddress, email));
    }
    for account in &contact.online_accounts {
        clauses.push(local_part(DetailField::AccountUri, &account.uri));
    }

    Filter::Or(clauses).and(Filter::aggregates())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::OnlineAccount;

    #[test]
    fn test_merge_candidates_match_names_and_addresses() {
        let mut berta = Contact::new("Berta", "Bertason");
        berta.email_addresses.push("berta.b@geemail.com".to_string());
        berta
            .online_accounts
            .push(OnlineAccount::new("/example/jabber/0", "bb@jabber.example"));

        let filter = merge_candidate_filter(&berta, "Berta Bertason", 7);

        let mut nickname = Contact::new("", "");
        nickname.sync_target = Some(crate::contact::SyncTarget::Aggregate);
        nickname.nicknames.push("Big Berta".to_string());
        assert!(filter.matches(&nickname));

        let mut same_mailbox = Contact::new("Someone", "Else");
        same_mailbox.sync_target = Some(crate::contact::SyncTarget::Aggregate);
        same_mailbox
            .email_addresses
            .push("Berta.B@work.example".to_string());
        assert!(filter.matches(&same_mailbox));

        let mut stranger = Contact::new("Carlo", "Carlosson");
        stranger.sync_target = Some(crate::contact::SyncTarget::Aggregate);
        assert!(!filter.matches(&stranger));

        let mut constituent = Contact::new("Berta", "Bertason");
        constituent.sync_target = Some(crate::contact::SyncTarget::Local);
        assert!(!filter.matches(&constituent));
    }

    #[test]
    fn test_merge_candidates_without_name_use_label() {
        let mut contact = Contact::default();
        contact.display_label = "Zed".to_string();
        let filter = merge_candidate_filter(&contact, "", 7);

        let mut zed = Contact::new("Zedediah", "");
        zed.sync_target = Some(crate::contact::SyncTarget::Aggregate);
        assert!(filter.matches(&zed));
    }
}
