//! Contact records as exchanged with the backing store.
//!
//! A [`Contact`] carries only the detail kinds the cache works with. Fetches
//! may be partial: a [`FetchHint`] names the detail kinds a store request
//! should fill in, and [`Contact::merge_unfetched`] folds a partial result
//! over what was already known.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Internal numeric id of a contact. `0` is never a valid id.
pub type ContactId = u32;

/// Presence states, ordered the way the online view sorts them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    #[default]
    Unknown,
    Available,
    Hidden,
    Busy,
    Away,
    ExtendedAway,
    Offline,
}

impl PresenceState {
    pub fn is_online(self) -> bool {
        self >= PresenceState::Available && self <= PresenceState::ExtendedAway
    }
}

/// Origin of a contact record.
///
/// Aggregates are the merged, top-level contacts; everything else is a
/// constituent belonging to one or more aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTarget {
    Aggregate,
    Local,
    /// A local constituent demoted when merged into an aggregate that
    /// already owned a local constituent.
    WasLocal,
    Other(String),
}

impl SyncTarget {
    pub fn as_str(&self) -> &str {
        match self {
            SyncTarget::Aggregate => "aggregate",
            SyncTarget::Local => "local",
            SyncTarget::WasLocal => "was_local",
            SyncTarget::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Name {
    pub first: String,
    pub last: String,
}

impl Name {
    pub fn new(first: impl Into<String>, last: impl Into<String>) -> Self {
        Self {
            first: first.into(),
            last: last.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.last.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnlineAccount {
    /// Local account path, e.g. `/example/jabber/0`.
    pub path: String,
    pub uri: String,
}

impl OnlineAccount {
    pub fn new(path: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            uri: uri.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub state: PresenceState,
    pub nickname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avatar {
    pub url: String,
    /// Free-form tag such as `local` or `picture:<account>`.
    #[serde(default)]
    pub metadata: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contact {
    pub id: ContactId,
    pub sync_target: Option<SyncTarget>,
    pub name: Name,
    /// Label assigned by the backend, used when nothing better is known.
    pub display_label: String,
    pub favorite: bool,
    pub nicknames: Vec<String>,
    pub organization: String,
    pub phone_numbers: Vec<String>,
    pub email_addresses: Vec<String>,
    pub online_accounts: Vec<OnlineAccount>,
    pub presence: Presence,
    pub avatars: Vec<Avatar>,
}

bitflags! {
    /// Detail kinds a fetch may be restricted to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DetailTypes: u32 {
        const SYNC_TARGET = 1 << 0;
        const NAME = 1 << 1;
        const DISPLAY_LABEL = 1 << 2;
        const FAVORITE = 1 << 3;
        const NICKNAME = 1 << 4;
        const ORGANIZATION = 1 << 5;
        const PHONE_NUMBER = 1 << 6;
        const EMAIL_ADDRESS = 1 << 7;
        const ONLINE_ACCOUNT = 1 << 8;
        const PRESENCE = 1 << 9;
        const AVATAR = 1 << 10;
    }
}

bitflags! {
    /// Address kinds a consumer needs available in population fetches.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct FetchTypes: u8 {
        const ACCOUNT_URI = 1 << 0;
        const PHONE_NUMBER = 1 << 1;
        const EMAIL_ADDRESS = 1 << 2;
    }
}

impl FetchTypes {
    pub fn detail_types(self) -> DetailTypes {
        let mut types = DetailTypes::empty();
        if self.contains(FetchTypes::ACCOUNT_URI) {
            types |= DetailTypes::ONLINE_ACCOUNT;
        }
        if self.contains(FetchTypes::PHONE_NUMBER) {
            types |= DetailTypes::PHONE_NUMBER;
        }
        if self.contains(FetchTypes::EMAIL_ADDRESS) {
            types |= DetailTypes::EMAIL_ADDRESS;
        }
        types
    }
}

/// Which detail kinds a store request should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchHint {
    types: Option<DetailTypes>,
}

impl FetchHint {
    /// Every detail kind.
    pub const FULL: FetchHint = FetchHint { types: None };

    pub fn only(types: DetailTypes) -> Self {
        Self { types: Some(types) }
    }

    pub fn is_full(&self) -> bool {
        self.types.is_none()
    }

    pub fn detail_types(&self) -> DetailTypes {
        self.types.unwrap_or(DetailTypes::all())
    }

    /// Hint used for the bulk metadata population of all contacts.
    pub fn metadata(fetch_types: FetchTypes) -> Self {
        Self::only(
            DetailTypes::SYNC_TARGET
                | DetailTypes::NAME
                | DetailTypes::DISPLAY_LABEL
                | DetailTypes::FAVORITE
                | fetch_types.detail_types(),
        )
    }

    /// Metadata plus presence, for the online view.
    pub fn online(fetch_types: FetchTypes) -> Self {
        Self::only(Self::metadata(fetch_types).detail_types() | DetailTypes::PRESENCE)
    }

    /// Online details plus avatars, for favorites and resolved contacts.
    pub fn favorites(fetch_types: FetchTypes) -> Self {
        Self::only(Self::online(fetch_types).detail_types() | DetailTypes::AVATAR)
    }
}

impl Contact {
    pub fn new(first: impl Into<String>, last: impl Into<String>) -> Self {
        Self {
            name: Name::new(first, last),
            ..Default::default()
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.sync_target, Some(SyncTarget::Aggregate))
    }

    /// Whether the contact is shown at top level (an aggregate, or a record
    /// from a store that does not aggregate at all).
    pub fn is_top_level(&self) -> bool {
        matches!(self.sync_target, None | Some(SyncTarget::Aggregate))
    }

    /// A copy restricted to the given detail kinds. The id is always kept.
    pub fn project(&self, types: DetailTypes) -> Contact {
        let mut projected = Contact {
            id: self.id,
            ..Default::default()
        };
        projected.copy_details(self, types);
        projected
    }

    /// Fill every detail kind *not* in `fetched` from `previous`.
    pub fn merge_unfetched(&mut self, previous: &Contact, fetched: DetailTypes) {
        self.copy_details(previous, fetched.complement());
    }

    fn copy_details(&mut self, from: &Contact, types: DetailTypes) {
        if types.contains(DetailTypes::SYNC_TARGET) {
            self.sync_target = from.sync_target.clone();
        }
        if types.contains(DetailTypes::NAME) {
            self.name = from.name.clone();
        }
        if types.contains(DetailTypes::DISPLAY_LABEL) {
            self.display_label = from.display_label.clone();
        }
        if types.contains(DetailTypes::FAVORITE) {
            self.favorite = from.favorite;
        }
        if types.contains(DetailTypes::NICKNAME) {
            self.nicknames = from.nicknames.clone();
        }
        if types.contains(DetailTypes::ORGANIZATION) {
            self.organization = from.organization.clone();
        }
        if types.contains(DetailTypes::PHONE_NUMBER) {
            self.phone_numbers = from.phone_numbers.clone();
        }
        if types.contains(DetailTypes::EMAIL_ADDRESS) {
            self.email_addresses = from.email_addresses.clone();
        }
        if types.contains(DetailTypes::ONLINE_ACCOUNT) {
            self.online_accounts = from.online_accounts.clone();
        }
        if types.contains(DetailTypes::PRESENCE) {
            self.presence = from.presence.clone();
        }
        if types.contains(DetailTypes::AVATAR) {
            self.avatars = from.avatars.clone();
        }
    }
}
