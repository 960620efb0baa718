//! End-to-end tests of the contact cache over the in-process store.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::{broadcast, mpsc};

use contact_cache::cache::{
    Address, AddressKey, CachedContact, ChangeListener, ContactCache, ItemData, ResolveListener,
    View, ViewListener,
};
use contact_cache::config::CacheConfig;
use contact_cache::contact::{Contact, ContactId, FetchTypes, OnlineAccount, SyncTarget};
use contact_cache::label::NameProperty;
use contact_cache::store::{
    ChangeNotification, ContactStore, EventSink, LocalStore, RequestKind, StoreRequest,
    SELF_CONTACT_ID,
};

// =============================================================================
// Test Helpers
// =============================================================================

const JABBER: &str = "/example/jabber/0";

struct ResolveRecorder(mpsc::UnboundedSender<(Address, Option<CachedContact>)>);

impl ResolveListener for ResolveRecorder {
    fn address_resolved(&self, address: &Address, item: Option<&CachedContact>) {
        let _ = self.0.send((address.clone(), item.cloned()));
    }
}

/// Forwards the view of every pass that may have changed rows.
struct ViewRecorder(mpsc::UnboundedSender<View>);

impl ViewListener for ViewRecorder {
    fn inserted(&self, view: View, _rows: Range<usize>, _ids: &[ContactId]) {
        let _ = self.0.send(view);
    }

    fn removed(&self, view: View, _rows: Range<usize>) {
        let _ = self.0.send(view);
    }

    fn items_changed(&self, view: View) {
        let _ = self.0.send(view);
    }

    fn populated(&self, view: View) {
        let _ = self.0.send(view);
    }
}

/// Forwards only the views that finished populating.
struct PopulationRecorder(mpsc::UnboundedSender<View>);

impl ViewListener for PopulationRecorder {
    fn populated(&self, view: View) {
        let _ = self.0.send(view);
    }
}

struct ChangeRecorder(mpsc::UnboundedSender<HashSet<AddressKey>>);

impl ChangeListener for ChangeRecorder {
    fn address_resolutions_changed(&self, keys: &HashSet<AddressKey>) {
        let _ = self.0.send(keys.clone());
    }
}

#[derive(Debug, PartialEq)]
enum DataEvent {
    Constituents(Vec<ContactId>),
    MergeCandidates(Vec<ContactId>),
    AggregationCompleted,
}

struct DataRecorder(mpsc::UnboundedSender<DataEvent>);

impl ItemData for DataRecorder {
    fn constituents_fetched(&self, ids: &[ContactId]) {
        let _ = self.0.send(DataEvent::Constituents(ids.to_vec()));
    }

    fn merge_candidates_fetched(&self, ids: &[ContactId]) {
        let _ = self.0.send(DataEvent::MergeCandidates(ids.to_vec()));
    }

    fn aggregation_operation_completed(&self) {
        let _ = self.0.send(DataEvent::AggregationCompleted);
    }
}

/// Alfred, Berta and Carlo in a fresh store.
struct Fixture {
    store: Arc<LocalStore>,
    cache: ContactCache,
    alfred: ContactId,
    berta: ContactId,
    carlo: ContactId,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(LocalStore::in_memory());

        let mut alfred = Contact::new("Alfred", "Alfredson");
        alfred.phone_numbers.push("+358474005000".to_string());

        let mut berta = Contact::new("Berta", "Bertason");
        berta.email_addresses.push("berta.b@geemail.com".to_string());
        berta
            .online_accounts
            .push(OnlineAccount::new(JABBER, "berta.b@geemail.com"));

        let mut carlo = Contact::new("Carlo", "Zanetti");
        carlo.phone_numbers.push("+358471112222".to_string());

        let ids = store.save_now(vec![alfred, berta, carlo]).unwrap();
        let cache = ContactCache::new(store.clone(), CacheConfig::default());

        Self {
            store,
            cache,
            alfred: ids[0],
            berta: ids[1],
            carlo: ids[2],
        }
    }

    fn resolve_listener(&self) -> (contact_cache::cache::Subscription, Resolutions) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self
            .cache
            .register_resolve_listener(Arc::new(ResolveRecorder(tx)));
        (listener, rx)
    }
}

type Resolutions = mpsc::UnboundedReceiver<(Address, Option<CachedContact>)>;

/// Parks every request until the test releases it to the wrapped store.
struct HeldStore {
    inner: Arc<LocalStore>,
    held: Mutex<Vec<(StoreRequest, EventSink)>>,
}

impl HeldStore {
    fn new(inner: Arc<LocalStore>) -> Self {
        Self {
            inner,
            held: Mutex::new(Vec::new()),
        }
    }

    fn held(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self) {
        let held = std::mem::take(&mut *self.held.lock());
        for (request, sink) in held {
            self.inner.start(request, sink);
        }
    }
}

impl ContactStore for HeldStore {
    fn start(&self, request: StoreRequest, sink: EventSink) {
        self.held.lock().push((request, sink));
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.subscribe()
    }

    fn self_contact_id(&self) -> ContactId {
        self.inner.self_contact_id()
    }
}

/// Register a view listener and wait until the view is populated.
async fn populate(cache: &ContactCache, view: View) -> mpsc::UnboundedReceiver<View> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    cache.register_view(view, Arc::new(ViewRecorder(tx)), FetchTypes::all());
    while !cache.is_populated(view) {
        rx.recv().await.expect("view listener dropped");
    }
    rx
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition never became true");
}

async fn next_resolution(rx: &mut Resolutions) -> Option<CachedContact> {
    rx.recv().await.expect("resolve listener dropped").1
}

/// Populate every view and wait for the last population phase.
async fn populate_all(cache: &ContactCache) -> mpsc::UnboundedReceiver<View> {
    let events = populate(cache, View::All).await;
    eventually(|| cache.is_populated(View::Online)).await;
    events
}

// =============================================================================
// Address resolution
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_resolve_scenario() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let (listener, mut rx) = fixture.resolve_listener();

    assert!(cache
        .resolve_phone_number(listener, "+358470000000", false)
        .is_none());
    assert_eq!(next_resolution(&mut rx).await, None);

    assert!(cache
        .resolve_email_address(listener, "berta.b@geemail.com", false)
        .is_none());
    let berta = next_resolution(&mut rx).await.expect("berta resolves");
    assert_eq!(berta.id, fixture.berta);
    assert_eq!(berta.contact.name.first, "Berta");

    let by_account = match cache.resolve_online_account(listener, JABBER, "berta.b@geemail.com", false) {
        Some(item) => item,
        None => next_resolution(&mut rx).await.expect("account resolves"),
    };
    assert_eq!(by_account.id, berta.id);

    // The unknown number was reported once and only once.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_phone_resolution_ignores_prefix_format() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let (listener, mut rx) = fixture.resolve_listener();

    assert!(cache
        .resolve_phone_number(listener, "+358474005000", false)
        .is_none());
    let alfred = next_resolution(&mut rx).await.expect("alfred resolves");
    assert_eq!(alfred.id, fixture.alfred);

    let local_form = cache.resolve_phone_number(listener, "0474005000", false);
    assert_eq!(local_form.map(|item| item.id), Some(fixture.alfred));
    assert_eq!(
        cache
            .item_by_phone_number("474005000", false)
            .map(|item| item.id),
        Some(fixture.alfred)
    );
}

#[tokio::test(start_paused = true)]
async fn test_resolve_with_completion_fetches_everything() {
    let fixture = Fixture::new();
    let (listener, mut rx) = fixture.resolve_listener();

    assert!(fixture
        .cache
        .resolve_phone_number(listener, "0471112222", true)
        .is_none());
    let carlo = next_resolution(&mut rx).await.expect("carlo resolves");
    assert_eq!(carlo.id, fixture.carlo);
    assert!(carlo.is_complete());
    assert_eq!(carlo.display_label, "Carlo Zanetti");
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_resolution_issues_one_query() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let (listener, mut rx) = fixture.resolve_listener();

    assert!(cache
        .resolve_email_address(listener, "nobody@example.com", false)
        .is_none());
    assert!(cache
        .resolve_email_address(listener, "Nobody@Example.com", false)
        .is_none());

    assert_eq!(next_resolution(&mut rx).await, None);
    assert_eq!(next_resolution(&mut rx).await, None);
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unusable_address_is_not_queued() {
    let fixture = Fixture::new();
    let (listener, mut rx) = fixture.resolve_listener();

    assert!(fixture
        .cache
        .resolve_phone_number(listener, "not a number", false)
        .is_none());
    assert!(fixture
        .cache
        .resolve_email_address(listener, "   ", false)
        .is_none());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_resolution_reports_no_match() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let (listener, mut rx) = fixture.resolve_listener();

    fixture.store.fail_next(RequestKind::Fetch);
    assert!(cache
        .resolve_email_address(listener, "berta.b@geemail.com", false)
        .is_none());
    assert_eq!(next_resolution(&mut rx).await, None);

    // The queue moved on and a new request reaches the store.
    assert!(cache
        .resolve_email_address(listener, "berta.b@geemail.com", false)
        .is_none());
    let berta = next_resolution(&mut rx).await.expect("berta resolves");
    assert_eq!(berta.id, fixture.berta);
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_listener_is_not_called() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let (listener, mut rx) = fixture.resolve_listener();

    assert!(cache
        .resolve_email_address(listener, "nobody@example.com", false)
        .is_none());
    cache.unregister_resolve_listener(listener);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_keeps_in_flight_resolution() {
    let fixture = Fixture::new();
    let store = Arc::new(HeldStore::new(fixture.store.clone()));
    let cache = ContactCache::new(store.clone(), CacheConfig::default());
    let (tx, mut first_rx) = mpsc::unbounded_channel();
    let first = cache.register_resolve_listener(Arc::new(ResolveRecorder(tx)));
    let (tx, mut second_rx) = mpsc::unbounded_channel();
    let second = cache.register_resolve_listener(Arc::new(ResolveRecorder(tx)));

    assert!(cache
        .resolve_email_address(first, "nobody@example.com", false)
        .is_none());
    eventually(|| store.held() == 1).await;

    cache.unregister_resolve_listener(first);
    assert!(cache
        .resolve_email_address(second, "berta.b@geemail.com", false)
        .is_none());

    // Finishing the orphaned query must not consume the one queued behind it.
    store.release();
    eventually(|| store.held() == 1).await;
    store.release();

    let (address, item) = second_rx.recv().await.expect("resolve listener dropped");
    assert_eq!(address, Address::email("berta.b@geemail.com"));
    assert_eq!(item.map(|item| item.id), Some(fixture.berta));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(first_rx.try_recv().is_err());
    assert!(second_rx.try_recv().is_err());
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_address_resolves_when_contact_appears() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let _view = populate(cache, View::All).await;
    let (listener, mut rx) = fixture.resolve_listener();

    assert!(cache
        .resolve_email_address(listener, "late@example.com", false)
        .is_none());
    assert_eq!(next_resolution(&mut rx).await, None);

    let mut late = Contact::new("Lena", "Late");
    late.email_addresses.push("late@example.com".to_string());
    let id = fixture.store.save_now(vec![late]).unwrap()[0];

    let found = next_resolution(&mut rx).await.expect("late contact resolves");
    assert_eq!(found.id, id);
    assert_eq!(found.contact.name.first, "Lena");
}

#[tokio::test(start_paused = true)]
async fn test_shared_suffix_removal_falls_back() {
    let store = Arc::new(LocalStore::in_memory());
    let mut freddy = Contact::new("Freddy", "Fisher");
    freddy.phone_numbers.push("61188889999".to_string());
    let mut graeme = Contact::new("Graeme", "Grant");
    graeme.phone_numbers.push("99988889999".to_string());
    let freddy = store.save_now(vec![freddy]).unwrap()[0];
    let graeme = store.save_now(vec![graeme]).unwrap()[0];

    let cache = ContactCache::new(store.clone(), CacheConfig::default());
    let (tx, mut changes) = mpsc::unbounded_channel();
    cache.register_change_listener(Arc::new(ChangeRecorder(tx)));
    let _view = populate(&cache, View::All).await;
    while changes.try_recv().is_ok() {}

    assert_eq!(
        cache.item_by_phone_number("99988889999", false).map(|item| item.id),
        Some(graeme)
    );
    assert_eq!(
        cache.item_by_phone_number("61188889999", false).map(|item| item.id),
        Some(freddy)
    );

    store.remove_now(&[graeme]).unwrap();

    let key = Address::phone("99988889999").key(7).unwrap();
    loop {
        let changed = changes.recv().await.expect("change listener dropped");
        if changed.contains(&key) {
            break;
        }
    }
    assert_eq!(
        cache.item_by_phone_number("99988889999", false).map(|item| item.id),
        Some(freddy)
    );
}

// =============================================================================
// Items and views
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_complete_item() {
    let fixture = Fixture::new();

    let carlo = fixture
        .cache
        .complete_item(fixture.carlo)
        .await
        .expect("carlo exists");
    assert!(carlo.is_complete());
    assert_eq!(carlo.contact.phone_numbers, vec!["+358471112222".to_string()]);

    assert_eq!(fixture.cache.complete_item(999).await, None);
    assert_eq!(fixture.cache.complete_item(0).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_views_follow_store_changes() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let mut events = populate(cache, View::All).await;

    assert_eq!(
        cache.contacts(View::All),
        vec![fixture.alfred, fixture.berta, fixture.carlo]
    );
    assert!(!cache.contacts(View::All).contains(&SELF_CONTACT_ID));
    assert_eq!(cache.contact_index(View::All, fixture.carlo), Some(2));

    let aaron = fixture
        .store
        .save_now(vec![Contact::new("Aaron", "Aaronson")])
        .unwrap()[0];
    while cache.contacts(View::All).len() < 4 {
        events.recv().await.expect("view listener dropped");
    }
    assert_eq!(cache.contacts(View::All)[0], aaron);

    fixture.store.remove_now(&[fixture.berta]).unwrap();
    while cache.contacts(View::All).contains(&fixture.berta) {
        events.recv().await.expect("view listener dropped");
    }
    assert_eq!(
        cache.contacts(View::All),
        vec![aaron, fixture.alfred, fixture.carlo]
    );
}

#[tokio::test(start_paused = true)]
async fn test_favorites_view() {
    let store = Arc::new(LocalStore::in_memory());
    let mut dora = Contact::new("Dora", "Dorsey");
    dora.favorite = true;
    let ids = store
        .save_now(vec![Contact::new("Ernie", "Ernst"), dora])
        .unwrap();
    let cache = ContactCache::new(store.clone(), CacheConfig::default());

    let _events = populate(&cache, View::Favorites).await;
    assert_eq!(cache.contacts(View::Favorites), vec![ids[1]]);
}

#[tokio::test(start_paused = true)]
async fn test_name_groups() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let _events = populate(cache, View::All).await;

    assert_eq!(cache.name_group(fixture.alfred).as_deref(), Some("A"));
    assert_eq!(cache.name_group(fixture.carlo).as_deref(), Some("C"));
    assert!(cache.name_group_members("B").contains(&fixture.berta));
    assert_eq!(cache.name_group(SELF_CONTACT_ID), None);

    cache.set_group_property(NameProperty::LastName);
    assert_eq!(cache.name_group(fixture.carlo).as_deref(), Some("Z"));
    assert!(cache.name_group_members("C").is_empty());
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_population_order() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let (tx, mut populated) = mpsc::unbounded_channel();
    for view in [View::Online, View::All, View::Favorites] {
        cache.register_view(view, Arc::new(PopulationRecorder(tx.clone())), FetchTypes::all());
    }

    let mut order = Vec::new();
    while order.len() < 3 {
        order.push(populated.recv().await.expect("view listener dropped"));
    }
    assert_eq!(order, vec![View::Favorites, View::All, View::Online]);
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), 3);
}

#[tokio::test(start_paused = true)]
async fn test_change_burst_is_one_fetch() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let _events = populate_all(cache).await;
    let before = fixture.store.request_count(RequestKind::Fetch);

    for i in 0..5 {
        fixture
            .store
            .save_now(vec![Contact::new(format!("Burst{i}"), "Person")])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), before);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), before + 1);
    assert_eq!(cache.contacts(View::All).len(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_steady_changes_flush_at_max_wait() {
    let fixture = Fixture::new();
    let _events = populate_all(&fixture.cache).await;
    let before = fixture.store.request_count(RequestKind::Fetch);

    // Every add arrives within the quiet period of the previous one.
    for i in 0..12 {
        fixture
            .store
            .save_now(vec![Contact::new(format!("Steady{i}"), "Person")])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), before);

    for i in 12..16 {
        fixture
            .store
            .save_now(vec![Contact::new(format!("Steady{i}"), "Person")])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), before + 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), before + 2);
    assert_eq!(fixture.cache.contacts(View::All).len(), 19);
}

#[tokio::test(start_paused = true)]
async fn test_wider_fetch_types_refetch_in_two_passes() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let (tx, _populated) = mpsc::unbounded_channel();
    cache.register_view(
        View::Online,
        Arc::new(PopulationRecorder(tx.clone())),
        FetchTypes::PHONE_NUMBER,
    );
    eventually(|| cache.is_populated(View::Online)).await;
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), 3);
    assert!(cache
        .item_by_email_address("berta.b@geemail.com", false)
        .is_none());

    cache.register_view(
        View::All,
        Arc::new(PopulationRecorder(tx)),
        FetchTypes::EMAIL_ADDRESS,
    );
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Favorites first, then everyone else.
    assert_eq!(fixture.store.request_count(RequestKind::Fetch), 5);
    assert_eq!(
        cache
            .item_by_email_address("berta.b@geemail.com", false)
            .map(|item| item.id),
        Some(fixture.berta)
    );
}

// =============================================================================
// Store failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_sync_leaves_view_and_chain_continues() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let store = &fixture.store;
    let _events = populate_all(cache).await;
    let queries = store.request_count(RequestKind::QueryIds);

    // The Favorites step of the resync fails, All and Online still run.
    store.fail_next(RequestKind::QueryIds);
    let mut dora = Contact::new("Dora", "Dorsey");
    dora.favorite = true;
    let dora = store.save_now(vec![dora]).unwrap()[0];

    eventually(|| cache.contacts(View::All).contains(&dora)).await;
    eventually(|| store.request_count(RequestKind::QueryIds) == queries + 3).await;
    assert!(cache.contacts(View::Favorites).is_empty());

    // The next resync brings the favorites view up to date.
    store
        .save_now(vec![Contact::new("Ernie", "Ernst")])
        .unwrap();
    eventually(|| cache.contacts(View::Favorites) == vec![dora]).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_relationship_fetch_reports_no_constituents() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let (tx, mut data) = mpsc::unbounded_channel();
    cache.attach_item_data(fixture.alfred, Arc::new(DataRecorder(tx)));

    fixture.store.fail_next(RequestKind::FetchRelationships);
    assert!(cache.fetch_constituents(fixture.alfred));
    let event = wait_for(&mut data, |event| matches!(event, DataEvent::Constituents(_))).await;
    assert_eq!(event, DataEvent::Constituents(Vec::new()));

    assert!(cache.fetch_constituents(fixture.alfred));
    let event = wait_for(&mut data, |event| matches!(event, DataEvent::Constituents(_))).await;
    assert_eq!(
        event,
        DataEvent::Constituents(fixture.store.constituents_of(fixture.alfred))
    );
}

// =============================================================================
// Aggregation
// =============================================================================

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<DataEvent>,
    wanted: impl Fn(&DataEvent) -> bool,
) -> DataEvent {
    loop {
        let event = rx.recv().await.expect("item data dropped");
        if wanted(&event) {
            return event;
        }
    }
}

/// Drain pending item data events, counting aggregation completions.
fn completions(rx: &mut mpsc::UnboundedReceiver<DataEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if event == DataEvent::AggregationCompleted {
            count += 1;
        }
    }
    count
}

fn sync_target(store: &LocalStore, id: ContactId) -> Option<SyncTarget> {
    store.contact(id).and_then(|contact| contact.sync_target)
}

#[tokio::test(start_paused = true)]
async fn test_aggregation_demotes_colliding_local() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let store = &fixture.store;
    let (tx, mut data) = mpsc::unbounded_channel();
    cache.attach_item_data(fixture.alfred, Arc::new(DataRecorder(tx)));

    assert!(!cache.aggregate_contacts(fixture.alfred, fixture.alfred));
    assert!(!cache.aggregate_contacts(0, fixture.carlo));
    assert!(cache.aggregate_contacts(fixture.alfred, fixture.carlo));

    wait_for(&mut data, |event| *event == DataEvent::AggregationCompleted).await;
    eventually(|| {
        let constituents = store.constituents_of(fixture.alfred);
        constituents.len() == 2
            && constituents
                .iter()
                .any(|id| sync_target(store, *id) == Some(SyncTarget::WasLocal))
    })
    .await;
    // One link batch under alfred; the unlink batch belongs to carlo.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(completions(&mut data), 0);

    let targets: Vec<Option<SyncTarget>> = store
        .constituents_of(fixture.alfred)
        .iter()
        .map(|id| sync_target(store, *id))
        .collect();
    assert_eq!(
        targets
            .iter()
            .filter(|target| **target == Some(SyncTarget::Local))
            .count(),
        1
    );
    assert!(store.contact(fixture.carlo).is_none());

    // Split the demoted constituent off again.
    let demoted = store
        .constituents_of(fixture.alfred)
        .into_iter()
        .find(|id| sync_target(store, *id) == Some(SyncTarget::WasLocal))
        .unwrap();
    assert!(cache.fetch_constituents(fixture.alfred));
    let DataEvent::Constituents(mut fetched) =
        wait_for(&mut data, |event| matches!(event, DataEvent::Constituents(_))).await
    else {
        unreachable!();
    };
    let mut expected = store.constituents_of(fixture.alfred);
    fetched.sort_unstable();
    expected.sort_unstable();
    assert_eq!(fetched, expected);

    assert!(cache.disaggregate_contacts(fixture.alfred, demoted));
    eventually(|| {
        sync_target(store, demoted) == Some(SyncTarget::Local)
            && store.aggregate_of(demoted).is_some_and(|aggregate| aggregate != fixture.alfred)
    })
    .await;
    assert_eq!(store.constituents_of(fixture.alfred).len(), 1);

    // The separation link and the unlink are one batch each.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(completions(&mut data), 2);
}

#[tokio::test(start_paused = true)]
async fn test_merge_candidates() {
    let fixture = Fixture::new();
    let cache = &fixture.cache;
    let mut twin = Contact::new("Berta", "Beta");
    twin.email_addresses.push("berta.b@work.example".to_string());
    let twin = fixture.store.save_now(vec![twin]).unwrap()[0];

    cache.complete_item(fixture.berta).await.expect("berta exists");
    let (tx, mut data) = mpsc::unbounded_channel();
    cache.attach_item_data(fixture.berta, Arc::new(DataRecorder(tx)));

    assert!(cache.fetch_merge_candidates(fixture.berta));
    let event = wait_for(&mut data, |event| matches!(event, DataEvent::MergeCandidates(_))).await;
    assert_eq!(event, DataEvent::MergeCandidates(vec![twin]));
}
