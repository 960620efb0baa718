//! Display labels and avatar selection.

use serde::Deserialize;

use crate::contact::Contact;

/// Shown when a contact has no usable detail at all.
pub const UNNAMED_LABEL: &str = "(Unnamed)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayLabelOrder {
    #[default]
    FirstNameFirst,
    LastNameFirst,
}

impl DisplayLabelOrder {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first_name_first" | "firstnamefirst" => Some(DisplayLabelOrder::FirstNameFirst),
            "last_name_first" | "lastnamefirst" => Some(DisplayLabelOrder::LastNameFirst),
            _ => None,
        }
    }
}

/// Name component used for sorting and for name grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameProperty {
    #[default]
    FirstName,
    LastName,
}

impl NameProperty {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first_name" | "firstname" => Some(NameProperty::FirstName),
            "last_name" | "lastname" => Some(NameProperty::LastName),
            _ => None,
        }
    }

    pub fn of<'a>(&self, contact: &'a Contact) -> &'a str {
        match self {
            NameProperty::FirstName => &contact.name.first,
            NameProperty::LastName => &contact.name.last,
        }
    }
}

/// Build the label shown for a contact.
///
/// The name wins when there is one; otherwise the first non-empty of
/// nickname, presence nickname, account uri, email, organization, phone;
/// then the backend label; then [`UNNAMED_LABEL`].
pub fn generate_display_label(contact: &Contact, order: DisplayLabelOrder) -> String {
    let (first, second) = match order {
        DisplayLabelOrder::FirstNameFirst => (&contact.name.first, &contact.name.last),
        DisplayLabelOrder::LastNameFirst => (&contact.name.last, &contact.name.first),
    };

    let mut label = String::new();
    if !first.is_empty() {
        label.push_str(first);
    }
    if !second.is_empty() {
        if !label.is_empty() {
            label.push(' ');
        }
        label.push_str(second);
    }
    if !label.is_empty() {
        return label;
    }

    let label = non_name_label(contact);
    if !label.is_empty() {
        return label;
    }

    if !contact.display_label.is_empty() {
        return contact.display_label.clone();
    }

    UNNAMED_LABEL.to_string()
}

/// Label derived from anything but the name. Empty if nothing qualifies.
pub fn non_name_label(contact: &Contact) -> String {
    let candidates = contact
        .nicknames
        .iter()
        .chain(std::iter::once(&contact.presence.nickname))
        .chain(contact.online_accounts.iter().map(|account| &account.uri))
        .chain(contact.email_addresses.iter())
        .chain(std::iter::once(&contact.organization))
        .chain(contact.phone_numbers.iter());

    candidates
        .into_iter()
        .find(|value| !value.is_empty())
        .cloned()
        .unwrap_or_default()
}

/// Pick an avatar url.
///
/// With no fragments, an avatar tagged `local` wins, then the first local
/// file, then the first remote url. With fragments, each is tried in turn
/// against the avatar metadata prefix, preferring local files per fragment.
pub fn filtered_avatar_url(contact: &Contact, metadata_fragments: &[&str]) -> Option<String> {
    if metadata_fragments.is_empty() {
        return avatar_url_with_metadata(contact, None);
    }

    metadata_fragments
        .iter()
        .find_map(|fragment| avatar_url_with_metadata(contact, Some(fragment)))
}

fn avatar_url_with_metadata(contact: &Contact, fragment: Option<&str>) -> Option<String> {
    let mut fallback: Option<&str> = None;

    for avatar in &contact.avatars {
        if avatar.url.is_empty() {
            continue;
        }
        match fragment {
            None if avatar.metadata == "local" => return Some(avatar.url.clone()),
            Some(prefix) if !avatar.metadata.starts_with(prefix) => continue,
            _ => {}
        }
        if is_local_url(&avatar.url) {
            return Some(avatar.url.clone());
        }
        fallback.get_or_insert(&avatar.url);
    }

    fallback.map(str::to_string)
}

fn is_local_url(url: &str) -> bool {
    match url.split_once("://") {
        Some((scheme, _)) => scheme.eq_ignore_ascii_case("file"),
        None => true,
    }
}
