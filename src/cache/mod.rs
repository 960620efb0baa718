//! The contact cache.
//!
//! This module provides:
//! - `ContactCache`, a cheap-to-clone handle over one shared engine
//! - the listener traits consumers implement
//! - the address, view and name-group types of the public API
//!
//! The engine starts lazily on first use, together with a coordinator task
//! that drives store requests. Once the last user and view registration is
//! gone an expiry timer is armed; when it fires the engine state is dropped
//! and the next call starts a fresh one.

mod address;
mod aggregation;
mod debounce;
mod driver;
mod engine;
mod groups;
mod item;
mod listeners;
mod view;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};

pub use address::{Address, AddressKey};
pub use groups::{default_groups, OTHER_GROUP};
pub use item::{CachedContact, ContactState};
pub use listeners::{
    ChangeListener, ItemData, ItemListener, NameGroupListener, NameGrouper, ResolveListener,
    Subscription, ViewListener,
};
pub use view::{synchronize, ListEdit, View};

use driver::Driver;
use engine::{Completion, Engine, Notice};

use crate::config::CacheConfig;
use crate::contact::{Contact, ContactId, FetchTypes};
use crate::label::{DisplayLabelOrder, NameProperty};
use crate::store::ContactStore;

pub(crate) struct Shared {
    engine: Mutex<Option<Engine>>,
    wake: Arc<Notify>,
    store: Arc<dyn ContactStore>,
    /// Survives engine teardown so preferences stick.
    config: Mutex<CacheConfig>,
    runtime: Handle,
    generation: AtomicU64,
}

pub(crate) fn deliver(notices: Vec<Notice>) {
    for notice in notices {
        notice();
    }
}

/// Handle to a contact cache.
///
/// Must be created from within a Tokio runtime; the coordinator task is
/// spawned on it.
#[derive(Clone)]
pub struct ContactCache {
    shared: Arc<Shared>,
}

impl ContactCache {
    pub fn new(store: Arc<dyn ContactStore>, config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine: Mutex::new(None),
                wake: Arc::new(Notify::new()),
                store,
                config: Mutex::new(config),
                runtime: Handle::current(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn start_engine(&self) -> Engine {
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let changes = self.shared.store.subscribe();
        let config = self.shared.config.lock().clone();

        let driver = Driver::new(
            Arc::downgrade(&self.shared),
            Arc::clone(&self.shared.wake),
            generation,
            events_rx,
            changes,
        );
        self.shared.runtime.spawn(driver.run());

        Engine::new(generation, Arc::clone(&self.shared.store), events_tx, config)
    }

    /// Run `f` on the engine, starting it if needed. Callbacks queued by `f`
    /// are delivered after the lock is released.
    fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let (result, notices) = {
            let mut guard = self.shared.engine.lock();
            let engine = guard.get_or_insert_with(|| self.start_engine());
            let result = f(engine);
            (result, engine.take_outbox())
        };
        self.shared.wake.notify_one();
        deliver(notices);
        result
    }

    // =========================================================================
    // Items
    // =========================================================================

    /// The item for `id`, created empty if unknown. With `require_complete`
    /// a full fetch is queued unless one is pending or done.
    pub fn item_by_id(&self, id: ContactId, require_complete: bool) -> Option<CachedContact> {
        self.with_engine(|engine| engine.item_by_id(id, require_complete))
    }

    pub fn existing_item(&self, id: ContactId) -> Option<CachedContact> {
        self.with_engine(|engine| engine.existing_item(id))
    }

    /// Wait until the item for `id` holds every detail. `None` when the
    /// store does not know the contact.
    pub async fn complete_item(&self, id: ContactId) -> Option<CachedContact> {
        match self.with_engine(|engine| engine.await_completion(id)) {
            Completion::Ready(item) => item,
            Completion::Pending(rx) => rx.await.ok().flatten(),
        }
    }

    pub fn refresh_contact(&self, id: ContactId) -> bool {
        self.with_engine(|engine| engine.refresh_contact(id))
    }

    pub fn item_by_phone_number(
        &self,
        number: &str,
        require_complete: bool,
    ) -> Option<CachedContact> {
        let address = Address::phone(number);
        self.with_engine(|engine| engine.item_by_address(&address, require_complete))
    }

    pub fn item_by_email_address(
        &self,
        email: &str,
        require_complete: bool,
    ) -> Option<CachedContact> {
        let address = Address::email(email);
        self.with_engine(|engine| engine.item_by_address(&address, require_complete))
    }

    pub fn item_by_online_account(
        &self,
        path: &str,
        uri: &str,
        require_complete: bool,
    ) -> Option<CachedContact> {
        let address = Address::account(path, uri);
        self.with_engine(|engine| engine.item_by_address(&address, require_complete))
    }

    pub fn self_contact_id(&self) -> ContactId {
        self.shared.store.self_contact_id()
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    pub fn register_resolve_listener(&self, listener: Arc<dyn ResolveListener>) -> Subscription {
        self.with_engine(|engine| engine.register_resolve_listener(listener))
    }

    /// Also drops every queued and pending resolution of the listener.
    pub fn unregister_resolve_listener(&self, subscription: Subscription) {
        self.with_engine(|engine| engine.unregister_resolve_listener(subscription))
    }

    /// Resolve a phone number to a contact.
    ///
    /// Returns the item at once when the number is indexed. Otherwise the
    /// store is queried and `listener` is told the outcome exactly once.
    /// Numbers without dialable digits return `None` and are not queued.
    pub fn resolve_phone_number(
        &self,
        listener: Subscription,
        number: &str,
        require_complete: bool,
    ) -> Option<CachedContact> {
        self.resolve(listener, Address::phone(number), require_complete)
    }

    pub fn resolve_email_address(
        &self,
        listener: Subscription,
        email: &str,
        require_complete: bool,
    ) -> Option<CachedContact> {
        self.resolve(listener, Address::email(email), require_complete)
    }

    pub fn resolve_online_account(
        &self,
        listener: Subscription,
        path: &str,
        uri: &str,
        require_complete: bool,
    ) -> Option<CachedContact> {
        self.resolve(listener, Address::account(path, uri), require_complete)
    }

    fn resolve(
        &self,
        listener: Subscription,
        address: Address,
        require_complete: bool,
    ) -> Option<CachedContact> {
        self.with_engine(|engine| engine.resolve(listener, address, require_complete))
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn contacts(&self, view: View) -> Vec<ContactId> {
        self.with_engine(|engine| engine.contacts(view))
    }

    pub fn contact_index(&self, view: View, id: ContactId) -> Option<usize> {
        self.with_engine(|engine| engine.contact_index(view, id))
    }

    pub fn is_populated(&self, view: View) -> bool {
        self.with_engine(|engine| engine.is_populated(view))
    }

    /// Register a view listener. The first registration starts population;
    /// later ones may widen `fetch_types`, which refetches what is cached.
    pub fn register_view(
        &self,
        view: View,
        listener: Arc<dyn ViewListener>,
        fetch_types: FetchTypes,
    ) -> Subscription {
        self.with_engine(|engine| engine.register_view(view, listener, fetch_types))
    }

    pub fn unregister_view(&self, subscription: Subscription) {
        self.with_engine(|engine| engine.unregister_view(subscription))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Queue a save. Contacts with id `0` are created.
    pub fn save_contact(&self, contact: Contact) {
        self.with_engine(|engine| engine.save_contact(contact))
    }

    pub fn remove_contact(&self, id: ContactId) -> bool {
        self.with_engine(|engine| engine.remove_contact(id))
    }

    /// Merge aggregate `source` into aggregate `target`.
    pub fn aggregate_contacts(&self, target: ContactId, source: ContactId) -> bool {
        self.with_engine(|engine| engine.aggregate_contacts(target, source))
    }

    pub fn disaggregate_contacts(&self, aggregate: ContactId, constituent: ContactId) -> bool {
        self.with_engine(|engine| engine.disaggregate_contacts(aggregate, constituent))
    }

    /// Results go to the item's attached [`ItemData`].
    pub fn fetch_constituents(&self, id: ContactId) -> bool {
        self.with_engine(|engine| engine.fetch_constituents(id))
    }

    /// Results go to the item's attached [`ItemData`].
    pub fn fetch_merge_candidates(&self, id: ContactId) -> bool {
        self.with_engine(|engine| engine.fetch_merge_candidates(id))
    }

    // =========================================================================
    // Name groups
    // =========================================================================

    pub fn name_group(&self, id: ContactId) -> Option<String> {
        self.with_engine(|engine| engine.name_group(id))
    }

    pub fn all_name_groups(&self) -> Vec<String> {
        self.with_engine(|engine| engine.all_name_groups())
    }

    pub fn name_group_members(&self, group: &str) -> HashSet<ContactId> {
        self.with_engine(|engine| engine.name_group_members(group))
    }

    pub fn name_groups(&self) -> HashMap<String, HashSet<ContactId>> {
        self.with_engine(|engine| engine.name_groups())
    }

    pub fn register_name_group_listener(
        &self,
        listener: Arc<dyn NameGroupListener>,
    ) -> Subscription {
        self.with_engine(|engine| engine.register_name_group_listener(listener))
    }

    pub fn unregister_name_group_listener(&self, subscription: Subscription) {
        self.with_engine(|engine| engine.unregister_name_group_listener(subscription))
    }

    pub fn set_name_grouper(&self, grouper: Option<Arc<dyn NameGrouper>>) {
        self.with_engine(|engine| engine.set_name_grouper(grouper))
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    pub fn register_change_listener(&self, listener: Arc<dyn ChangeListener>) -> Subscription {
        self.with_engine(|engine| engine.register_change_listener(listener))
    }

    pub fn unregister_change_listener(&self, subscription: Subscription) {
        self.with_engine(|engine| engine.unregister_change_listener(subscription))
    }

    pub fn register_item_listener(
        &self,
        id: ContactId,
        listener: Arc<dyn ItemListener>,
    ) -> Option<Subscription> {
        self.with_engine(|engine| engine.register_item_listener(id, listener))
    }

    pub fn unregister_item_listener(&self, subscription: Subscription) {
        self.with_engine(|engine| engine.unregister_item_listener(subscription))
    }

    /// Attach consumer state to an item, replacing any previous one.
    pub fn attach_item_data(&self, id: ContactId, data: Arc<dyn ItemData>) -> bool {
        self.with_engine(|engine| engine.attach_item_data(id, data))
    }

    pub fn detach_item_data(&self, id: ContactId) -> Option<Arc<dyn ItemData>> {
        self.with_engine(|engine| engine.detach_item_data(id))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Keep the cache alive while the subscription is held.
    pub fn register_user(&self) -> Subscription {
        self.with_engine(|engine| engine.register_user())
    }

    pub fn unregister_user(&self, subscription: Subscription) {
        self.with_engine(|engine| engine.unregister_user(subscription))
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    pub fn display_label_order(&self) -> DisplayLabelOrder {
        self.shared.config.lock().display_label_order
    }

    pub fn set_display_label_order(&self, order: DisplayLabelOrder) {
        self.shared.config.lock().display_label_order = order;
        self.with_engine(|engine| engine.set_display_label_order(order))
    }

    pub fn sort_property(&self) -> NameProperty {
        self.shared.config.lock().sort_property
    }

    pub fn set_sort_property(&self, property: NameProperty) {
        self.shared.config.lock().sort_property = property;
        self.with_engine(|engine| engine.set_sort_property(property))
    }

    pub fn group_property(&self) -> NameProperty {
        self.shared.config.lock().group_property
    }

    pub fn set_group_property(&self, property: NameProperty) {
        self.shared.config.lock().group_property = property;
        self.with_engine(|engine| engine.set_group_property(property))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use std::time::Duration;

    fn cache_with_grace(grace: Duration) -> (Arc<LocalStore>, ContactCache) {
        let store = Arc::new(LocalStore::in_memory());
        let config = CacheConfig {
            expiry_grace: grace,
            ..Default::default()
        };
        let cache = ContactCache::new(store.clone(), config);
        (store, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unused_cache_expires_after_grace() {
        let (_store, cache) = cache_with_grace(Duration::from_secs(30));
        let user = cache.register_user();
        assert!(cache.shared.engine.lock().is_some());

        cache.unregister_user(user);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cache.shared.engine.lock().is_some());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(cache.shared.engine.lock().is_none());

        // A new call starts the next generation.
        let _user = cache.register_user();
        assert!(cache.shared.engine.lock().is_some());
        assert_eq!(cache.shared.generation.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_disarms_expiry() {
        let (_store, cache) = cache_with_grace(Duration::from_secs(30));
        let first = cache.register_user();
        cache.unregister_user(first);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let _second = cache.register_user();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(cache.shared.engine.lock().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preferences_survive_expiry() {
        let (_store, cache) = cache_with_grace(Duration::from_secs(1));
        cache.set_sort_property(NameProperty::LastName);
        let user = cache.register_user();
        cache.unregister_user(user);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(cache.sort_property(), NameProperty::LastName);
        cache.with_engine(|engine| {
            assert_eq!(engine.config().sort_property, NameProperty::LastName)
        });
    }
}
