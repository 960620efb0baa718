//! In-memory contact cache over an asynchronous contact store.
//!
//! The cache keeps identity-stable items, sorted views with incremental
//! change notifications, an address index for resolving phone numbers,
//! email addresses and online accounts, and name groups. All store work is
//! driven by a single coordinator task; see [`cache::ContactCache`].

pub mod cache;
pub mod config;
pub mod contact;
pub mod error;
pub mod label;
pub mod phone;
pub mod store;
pub mod translit;

pub use cache::ContactCache;
pub use config::{CacheConfig, Config};
pub use contact::{Contact, ContactId};
pub use error::{StoreError, StoreResult};
