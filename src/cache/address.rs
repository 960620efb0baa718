//! Address → contact index.
//!
//! Addresses are indexed under normalized keys: minimized phone numbers,
//! lowercased email addresses, and (account path, lowercased uri) pairs.
//! Several contacts may share a key; phone lookups then prefer the entry with
//! the longest common trailing digit run, other kinds the earliest entry.

use std::collections::{HashMap, HashSet};

use crate::contact::{Contact, ContactId};
use crate::phone;

/// An address as given by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Phone(String),
    Email(String),
    Account { path: String, uri: String },
}

/// Normalized form an [`Address`] is indexed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressKey {
    Phone(String),
    Email(String),
    Account { path: String, uri: String },
}

impl Address {
    pub fn phone(number: impl Into<String>) -> Self {
        Address::Phone(number.into())
    }

    pub fn email(address: impl Into<String>) -> Self {
        Address::Email(address.into())
    }

    pub fn account(path: impl Into<String>, uri: impl Into<String>) -> Self {
        Address::Account {
            path: path.into(),
            uri: uri.into(),
        }
    }

    /// Key and match text, or `None` when the address cannot be indexed.
    pub fn normalize(&self, match_digits: usize) -> Option<(AddressKey, String)> {
        match self {
            Address::Phone(number) => phone_entry(number, match_digits),
            Address::Email(email) => {
                let lower = email.trim().to_lowercase();
                (!lower.is_empty()).then(|| (AddressKey::Email(lower.clone()), lower))
            }
            Address::Account { path, uri } => {
                let lower = uri.trim().to_lowercase();
                (!lower.is_empty()).then(|| {
                    (
                        AddressKey::Account {
                            path: path.clone(),
                            uri: lower.clone(),
                        },
                        lower,
                    )
                })
            }
        }
    }

    pub fn key(&self, match_digits: usize) -> Option<AddressKey> {
        self.normalize(match_digits).map(|(key, _)| key)
    }
}

fn phone_entry(number: &str, match_digits: usize) -> Option<(AddressKey, String)> {
    let minimized = phone::minimize(number, match_digits);
    if minimized.is_empty() {
        return None;
    }
    let digits = phone::dialable_digits(number).unwrap_or_default();
    Some((AddressKey::Phone(minimized), digits))
}

/// Every indexable address of a contact.
pub fn addresses_of(contact: &Contact, match_digits: usize) -> Vec<(AddressKey, String)> {
    let phones = contact
        .phone_numbers
        .iter()
        .filter_map(|number| phone_entry(number, match_digits));
    let emails = contact
        .email_addresses
        .iter()
        .filter_map(|email| Address::Email(email.clone()).normalize(match_digits));
    let accounts = contact.online_accounts.iter().filter_map(|account| {
        Address::Account {
            path: account.path.clone(),
            uri: account.uri.clone(),
        }
        .normalize(match_digits)
    });

    let mut seen = HashSet::new();
    phones
        .chain(emails)
        .chain(accounts)
        .filter(|entry| seen.insert(entry.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    id: ContactId,
    text: String,
}

#[derive(Debug, Default)]
pub(crate) struct AddressIndex {
    entries: HashMap<AddressKey, Vec<Entry>>,
    match_digits: usize,
}

impl AddressIndex {
    pub fn new(match_digits: usize) -> Self {
        Self {
            entries: HashMap::new(),
            match_digits,
        }
    }

    pub fn match_digits(&self) -> usize {
        self.match_digits
    }

    pub fn lookup(&self, address: &Address) -> Option<ContactId> {
        let (key, text) = address.normalize(self.match_digits)?;
        let entries = self.entries.get(&key)?;

        match key {
            AddressKey::Phone(_) => {
                let mut best: Option<(&Entry, usize)> = None;
                for entry in entries {
                    let common = phone::common_suffix_len(&entry.text, &text);
                    if best.map_or(true, |(_, len)| common > len) {
                        best = Some((entry, common));
                    }
                }
                best.map(|(entry, _)| entry.id)
            }
            _ => entries.first().map(|entry| entry.id),
        }
    }

    /// Replace the addresses indexed for `id`.
    ///
    /// Keys whose resolution may have changed are added to `changed`.
    /// Returns the keys that gained an entry.
    pub fn update(
        &mut self,
        id: ContactId,
        old: &[(AddressKey, String)],
        new: &[(AddressKey, String)],
        changed: &mut HashSet<AddressKey>,
    ) -> Vec<AddressKey> {
        let removed: Vec<&(AddressKey, String)> =
            old.iter().filter(|entry| !new.contains(entry)).collect();
        let inserted: Vec<&(AddressKey, String)> =
            new.iter().filter(|entry| !old.contains(entry)).collect();
        let before = self.snapshot(removed.iter().chain(&inserted).map(|(key, _)| key));

        for (key, text) in removed {
            self.remove_entry(id, key, text);
        }
        let mut added = Vec::new();
        for (key, text) in inserted {
            self.entries.entry(key.clone()).or_default().push(Entry {
                id,
                text: text.clone(),
            });
            added.push(key.clone());
        }

        self.record_changes(before, changed);
        added
    }

    pub fn remove(
        &mut self,
        id: ContactId,
        addresses: &[(AddressKey, String)],
        changed: &mut HashSet<AddressKey>,
    ) {
        let before = self.snapshot(addresses.iter().map(|(key, _)| key));
        for (key, text) in addresses {
            self.remove_entry(id, key, text);
        }
        self.record_changes(before, changed);
    }

    fn remove_entry(&mut self, id: ContactId, key: &AddressKey, text: &str) {
        let Some(entries) = self.entries.get_mut(key) else {
            return;
        };
        let Some(pos) = entries
            .iter()
            .position(|entry| entry.id == id && entry.text == text)
        else {
            return;
        };
        entries.remove(pos);
        if entries.is_empty() {
            self.entries.remove(key);
        }
    }

    fn snapshot<'a>(
        &self,
        keys: impl Iterator<Item = &'a AddressKey>,
    ) -> HashMap<AddressKey, Vec<Entry>> {
        keys.map(|key| {
            let entries = self.entries.get(key).cloned().unwrap_or_default();
            (key.clone(), entries)
        })
        .collect()
    }

    fn record_changes(
        &self,
        before: HashMap<AddressKey, Vec<Entry>>,
        changed: &mut HashSet<AddressKey>,
    ) {
        for (key, old) in before {
            let new = self.entries.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            if resolution_differs(&key, &old, new) {
                changed.insert(key);
            }
        }
    }
}

/// Whether a lookup of `key` may answer differently with `new` than with `old`.
///
/// Email and account lookups take the first entry. A phone lookup depends on
/// the queried digits, so any change is visible unless a single contact owns
/// the key throughout.
fn resolution_differs(key: &AddressKey, old: &[Entry], new: &[Entry]) -> bool {
    match key {
        AddressKey::Phone(_) => {
            if old == new {
                return false;
            }
            let sole_owner = |entries: &[Entry]| -> Option<ContactId> {
                let first = entries.first()?.id;
                entries.iter().all(|entry| entry.id == first).then_some(first)
            };
            match (sole_owner(old), sole_owner(new)) {
                (Some(before), Some(after)) => before != after,
                _ => true,
            }
        }
        _ => old.first().map(|entry| entry.id) != new.first().map(|entry| entry.id),
    }
}

/// A resolve call waiting for its address to show up.
#[derive(Debug, Clone)]
pub(crate) struct PendingResolution {
    pub address: Address,
    pub key: AddressKey,
    pub listener: super::listeners::Subscription,
    pub require_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::OnlineAccount;

    fn with_phone(id: ContactId, number: &str) -> Contact {
        Contact {
            id,
            phone_numbers: vec![number.to_string()],
            ..Default::default()
        }
    }

    fn index_contact(index: &mut AddressIndex, contact: &Contact) -> HashSet<AddressKey> {
        let mut changed = HashSet::new();
        let new = addresses_of(contact, index.match_digits());
        index.update(contact.id, &[], &new, &mut changed);
        changed
    }

    #[test]
    fn test_phone_lookup_ignores_formatting() {
        let mut index = AddressIndex::new(7);
        index_contact(&mut index, &with_phone(5, "+358470009955"));

        assert_eq!(index.lookup(&Address::phone("+358470009955")), Some(5));
        assert_eq!(index.lookup(&Address::phone("0470009955")), Some(5));
        assert_eq!(index.lookup(&Address::phone("+358470000000")), None);
        assert_eq!(index.lookup(&Address::phone("")), None);
    }

    #[test]
    fn test_shared_phone_key_prefers_longest_suffix() {
        let mut index = AddressIndex::new(7);
        let freddy = with_phone(10, "61188889999");
        let graeme = with_phone(11, "99988889999");

        let key = AddressKey::Phone(phone::minimize("188889999", 7));
        assert_eq!(index_contact(&mut index, &freddy), HashSet::from([key.clone()]));
        assert_eq!(index_contact(&mut index, &graeme), HashSet::from([key.clone()]));

        assert_eq!(index.lookup(&Address::phone("988889999")), Some(11));
        assert_eq!(index.lookup(&Address::phone("188889999")), Some(10));

        let mut changed = HashSet::new();
        index.remove(11, &addresses_of(&graeme, 7), &mut changed);
        assert_eq!(changed.len(), 1);
        assert_eq!(index.lookup(&Address::phone("988889999")), Some(10));

        let mut changed = HashSet::new();
        index.remove(10, &addresses_of(&freddy, 7), &mut changed);
        assert_eq!(changed, HashSet::from([key]));
        assert_eq!(index.lookup(&Address::phone("188889999")), None);
    }

    #[test]
    fn test_email_and_account_are_case_insensitive() {
        let mut index = AddressIndex::new(7);
        let contact = Contact {
            id: 3,
            email_addresses: vec!["Berta.B@GeeMail.com".to_string()],
            online_accounts: vec![OnlineAccount::new("/example/jabber/0", "Berta.B@GeeMail.com")],
            ..Default::default()
        };
        index_contact(&mut index, &contact);

        assert_eq!(index.lookup(&Address::email("berta.b@geemail.com")), Some(3));
        assert_eq!(
            index.lookup(&Address::account("/example/jabber/0", "BERTA.B@geemail.com")),
            Some(3)
        );
        assert_eq!(
            index.lookup(&Address::account("/example/sip/0", "berta.b@geemail.com")),
            None
        );
    }

    #[test]
    fn test_update_applies_only_the_difference() {
        let mut index = AddressIndex::new(7);
        let before = Contact {
            id: 8,
            email_addresses: vec!["old@example.com".to_string(), "kept@example.com".to_string()],
            ..Default::default()
        };
        let after = Contact {
            id: 8,
            email_addresses: vec!["kept@example.com".to_string(), "new@example.com".to_string()],
            ..Default::default()
        };
        index_contact(&mut index, &before);

        let mut changed = HashSet::new();
        let added = index.update(8, &addresses_of(&before, 7), &addresses_of(&after, 7), &mut changed);

        assert_eq!(added, vec![AddressKey::Email("new@example.com".to_string())]);
        assert_eq!(index.lookup(&Address::email("old@example.com")), None);
        assert_eq!(index.lookup(&Address::email("kept@example.com")), Some(8));
        assert_eq!(index.lookup(&Address::email("new@example.com")), Some(8));
    }

    #[test]
    fn test_sole_holder_gain_and_loss_are_changes() {
        let mut index = AddressIndex::new(7);
        let key = AddressKey::Email("shared@example.com".to_string());
        let first = Contact {
            id: 20,
            email_addresses: vec!["shared@example.com".to_string()],
            ..Default::default()
        };
        let second = Contact {
            id: 21,
            ..first.clone()
        };

        assert_eq!(index_contact(&mut index, &first), HashSet::from([key.clone()]));
        // The earlier entry still answers email lookups.
        assert!(index_contact(&mut index, &second).is_empty());

        let mut changed = HashSet::new();
        index.remove(20, &addresses_of(&first, 7), &mut changed);
        assert_eq!(changed, HashSet::from([key.clone()]));
        assert_eq!(index.lookup(&Address::email("shared@example.com")), Some(21));

        let mut changed = HashSet::new();
        index.remove(21, &addresses_of(&second, 7), &mut changed);
        assert_eq!(changed, HashSet::from([key]));
        assert_eq!(index.lookup(&Address::email("shared@example.com")), None);
    }

    #[test]
    fn test_phone_text_change_of_sole_owner_is_quiet() {
        let mut index = AddressIndex::new(7);
        let before = with_phone(30, "+358470009955");
        let after = with_phone(30, "0470009955");
        index_contact(&mut index, &before);

        let mut changed = HashSet::new();
        index.update(30, &addresses_of(&before, 7), &addresses_of(&after, 7), &mut changed);
        assert!(changed.is_empty());
        assert_eq!(index.lookup(&Address::phone("0470009955")), Some(30));
    }
}
