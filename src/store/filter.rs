//! Query filters and sort orders understood by every store.
//!
//! The algebra is intentionally small; [`Filter::matches`] gives any store
//! a reference evaluation so results agree across backends.

use std::cmp::Ordering;

use crate::contact::{Contact, ContactId, SyncTarget};
use crate::phone;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailField {
    FirstName,
    LastName,
    Nickname,
    EmailAddress,
    AccountPath,
    AccountUri,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exactly,
    Contains,
    StartsWith,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Favorite(bool),
    /// Presence state in the online range.
    Online,
    SyncTarget(SyncTarget),
    Ids(Vec<ContactId>),
    /// Trailing-digit match of any phone number.
    PhoneNumber {
        number: String,
        significant_digits: usize,
    },
    Detail {
        field: DetailField,
        value: String,
        mode: MatchMode,
        case_sensitive: bool,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn aggregates() -> Self {
        Filter::SyncTarget(SyncTarget::Aggregate)
    }

    pub fn detail(field: DetailField, value: impl Into<String>, mode: MatchMode) -> Self {
        Filter::Detail {
            field,
            value: value.into(),
            mode,
            case_sensitive: false,
        }
    }

    /// Combine with `other`, flattening nested conjunctions.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, other) | (other, Filter::All) => other,
            (Filter::And(mut lhs), Filter::And(rhs)) => {
                lhs.extend(rhs);
                Filter::And(lhs)
            }
            (Filter::And(mut lhs), other) => {
                lhs.push(other);
                Filter::And(lhs)
            }
            (this, other) => Filter::And(vec![this, other]),
        }
    }

    pub fn matches(&self, contact: &Contact) -> bool {
        match self {
            Filter::All => true,
            Filter::Favorite(favorite) => contact.favorite == *favorite,
            Filter::Online => contact.presence.state.is_online(),
            Filter::SyncTarget(target) => contact.sync_target.as_ref() == Some(target),
            Filter::Ids(ids) => ids.contains(&contact.id),
            Filter::PhoneNumber {
                number,
                significant_digits,
            } => {
                let wanted = phone::minimize(number, *significant_digits);
                !wanted.is_empty()
                    && contact
                        .phone_numbers
                        .iter()
                        .any(|candidate| phone::minimize(candidate, *significant_digits) == wanted)
            }
            Filter::Detail {
                field,
                value,
                mode,
                case_sensitive,
            } => detail_values(contact, *field)
                .any(|candidate| text_matches(candidate, value, *mode, *case_sensitive)),
            Filter::And(filters) => filters.iter().all(|filter| filter.matches(contact)),
            Filter::Or(filters) => filters.iter().any(|filter| filter.matches(contact)),
        }
    }
}

fn detail_values(contact: &Contact, field: DetailField) -> Box<dyn Iterator<Item = &str> + '_> {
    match field {
        DetailField::FirstName => Box::new(std::iter::once(contact.name.first.as_str())),
        DetailField::LastName => Box::new(std::iter::once(contact.name.last.as_str())),
        DetailField::Nickname => Box::new(contact.nicknames.iter().map(String::as_str)),
        DetailField::EmailAddress => Box::new(contact.email_addresses.iter().map(String::as_str)),
        DetailField::AccountPath => {
            Box::new(contact.online_accounts.iter().map(|account| account.path.as_str()))
        }
        DetailField::AccountUri => {
            Box::new(contact.online_accounts.iter().map(|account| account.uri.as_str()))
        }
    }
}

fn text_matches(candidate: &str, value: &str, mode: MatchMode, case_sensitive: bool) -> bool {
    let (candidate, value) = if case_sensitive {
        (candidate.to_string(), value.to_string())
    } else {
        (candidate.to_lowercase(), value.to_lowercase())
    };
    match mode {
        MatchMode::Exactly => candidate == value,
        MatchMode::Contains => candidate.contains(&value),
        MatchMode::StartsWith => candidate.starts_with(&value),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    FirstName,
    LastName,
    PresenceState,
}

/// Ascending, case-insensitive, blanks first, in field order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortOrder {
    pub fields: Vec<SortField>,
}

impl SortOrder {
    pub fn new(fields: impl Into<Vec<SortField>>) -> Self {
        Self {
            fields: fields.into(),
        }
    }

    pub fn compare(&self, a: &Contact, b: &Contact) -> Ordering {
        for field in &self.fields {
            let ordering = match field {
                SortField::FirstName => compare_text(&a.name.first, &b.name.first),
                SortField::LastName => compare_text(&a.name.last, &b.name.last),
                SortField::PresenceState => a.presence.state.cmp(&b.presence.state),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

fn compare_text(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{OnlineAccount, PresenceState};

    fn berta() -> Contact {
        let mut contact = Contact::new("Berta", "Bertason");
        contact.id = 3;
        contact.sync_target = Some(SyncTarget::Aggregate);
        contact.email_addresses.push("Berta.B@geemail.com".to_string());
        contact
            .online_accounts
            .push(OnlineAccount::new("/example/jabber/0", "berta.b@geemail.com"));
        contact.phone_numbers.push("+358470009955".to_string());
        contact
    }

    #[test]
    fn test_detail_filter_case_insensitive_exact() {
        let contact = berta();
        let filter = Filter::detail(DetailField::EmailAddress, "berta.b@GEEMAIL.com", MatchMode::Exactly);
        assert!(filter.matches(&contact));

        let filter = Filter::detail(DetailField::EmailAddress, "berta", MatchMode::Exactly);
        assert!(!filter.matches(&contact));
        let filter = Filter::detail(DetailField::EmailAddress, "berta", MatchMode::StartsWith);
        assert!(filter.matches(&contact));
    }

    #[test]
    fn test_phone_filter_matches_trailing_digits() {
        let contact = berta();
        let filter = Filter::PhoneNumber {
            number: "0470009955".to_string(),
            significant_digits: 7,
        };
        assert!(filter.matches(&contact));

        let filter = Filter::PhoneNumber {
            number: "not a number".to_string(),
            significant_digits: 7,
        };
        assert!(!filter.matches(&contact));
    }

    #[test]
    fn test_and_flattens() {
        let filter = Filter::Favorite(true)
            .and(Filter::aggregates())
            .and(Filter::All)
            .and(Filter::Online);
        assert_eq!(
            filter,
            Filter::And(vec![Filter::Favorite(true), Filter::aggregates(), Filter::Online])
        );
        assert_eq!(Filter::All.and(Filter::Online), Filter::Online);
    }

    #[test]
    fn test_sort_blanks_first_case_insensitive() {
        let sort = SortOrder::new([SortField::FirstName, SortField::LastName]);
        let a = Contact::new("alfred", "Zed");
        let b = Contact::new("Alfred", "Alfredson");
        let blank = Contact::new("", "Carlo");

        assert_eq!(sort.compare(&b, &a), Ordering::Less);
        assert_eq!(sort.compare(&blank, &a), Ordering::Less);
    }

    #[test]
    fn test_sort_presence_first() {
        let sort = SortOrder::new([SortField::PresenceState, SortField::FirstName]);
        let mut busy = Contact::new("Aaron", "");
        busy.presence.state = PresenceState::Busy;
        let mut available = Contact::new("Zelda", "");
        available.presence.state = PresenceState::Available;

        assert_eq!(sort.compare(&available, &busy), Ordering::Less);
    }
}
