//! Name-group membership.

use std::collections::{HashMap, HashSet};

use super::listeners::NameGrouper;
use crate::contact::{Contact, ContactId};
use crate::label::{self, NameProperty};
use crate::translit;

/// Group for contacts whose labels start with no known letter.
pub const OTHER_GROUP: &str = "#";

/// `A` to `Z` followed by [`OTHER_GROUP`].
pub fn default_groups() -> Vec<String> {
    ('A'..='Z')
        .map(|c| c.to_string())
        .chain(std::iter::once(OTHER_GROUP.to_string()))
        .collect()
}

/// Group key for a contact.
pub fn determine_group(
    contact: &Contact,
    display_label: &str,
    property: NameProperty,
    grouper: Option<&dyn NameGrouper>,
    known_groups: &[String],
) -> String {
    if let Some(group) = grouper.and_then(|grouper| grouper.name_group(contact, property)) {
        return group;
    }

    let known = |group: &Option<String>| {
        group
            .as_ref()
            .is_some_and(|group| known_groups.iter().any(|known| known == group))
    };

    let name = property.of(contact);
    let mut group = if !name.is_empty() {
        translit::index_bucket(name)
    } else if !display_label.is_empty() {
        translit::index_bucket(display_label)
    } else {
        None
    };

    if !known(&group) {
        let fallback = label::non_name_label(contact);
        if !fallback.is_empty() {
            group = translit::index_bucket(&fallback);
        }
    }

    match group {
        Some(group) if known(&Some(group.clone())) => group,
        _ => OTHER_GROUP.to_string(),
    }
}

#[derive(Debug, Default)]
pub(crate) struct NameGroupIndex {
    members: HashMap<String, HashSet<ContactId>>,
}

impl NameGroupIndex {
    pub fn add(&mut self, id: ContactId, group: &str, modified: &mut HashSet<String>) {
        if group.is_empty() {
            return;
        }
        if self.members.entry(group.to_string()).or_default().insert(id) {
            modified.insert(group.to_string());
        }
    }

    pub fn remove(&mut self, id: ContactId, group: &str, modified: &mut HashSet<String>) {
        if group.is_empty() {
            return;
        }
        if let Some(set) = self.members.get_mut(group) {
            if set.remove(&id) {
                modified.insert(group.to_string());
            }
        }
    }

    pub fn members(&self) -> HashMap<String, HashSet<ContactId>> {
        self.members
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(group, ids)| (group.clone(), ids.clone()))
            .collect()
    }

    pub fn members_of(&self, group: &str) -> HashSet<ContactId> {
        self.members.get(group).cloned().unwrap_or_default()
    }

    /// Current membership of the given groups, empty groups included.
    pub fn updates(&self, groups: &HashSet<String>) -> HashMap<String, HashSet<ContactId>> {
        groups
            .iter()
            .map(|group| {
                (
                    group.clone(),
                    self.members.get(group).cloned().unwrap_or_default(),
                )
            })
            .collect()
    }
}
