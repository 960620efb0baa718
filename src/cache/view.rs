//! Sorted views and the incremental list synchronization.
//!
//! A view is an ordered id list kept in step with the store's sort order.
//! When a fresh id query completes, [`synchronize`] computes the range
//! removals and insertions that turn the current list into the query result
//! without disturbing rows that did not move.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::contact::ContactId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    Favorites,
    All,
    Online,
}

impl View {
    pub const ALL: [View; 3] = [View::Favorites, View::All, View::Online];

    pub(crate) fn index(self) -> usize {
        match self {
            View::Favorites => 0,
            View::All => 1,
            View::Online => 2,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "favorites" | "favourites" => Some(View::Favorites),
            "all" => Some(View::All),
            "online" => Some(View::Online),
            _ => None,
        }
    }
}

/// One structural edit of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEdit {
    Remove { index: usize, count: usize },
    Insert { index: usize, ids: Vec<ContactId> },
}

impl ListEdit {
    pub fn rows(&self) -> Range<usize> {
        match self {
            ListEdit::Remove { index, count } => *index..*index + *count,
            ListEdit::Insert { index, ids } => *index..*index + ids.len(),
        }
    }

    pub fn apply(&self, ids: &mut Vec<ContactId>) {
        match self {
            ListEdit::Remove { index, count } => {
                ids.drain(*index..*index + *count);
            }
            ListEdit::Insert { index, ids: inserted } => {
                ids.splice(*index..*index, inserted.iter().copied());
            }
        }
    }
}

/// Edits turning `cache` into `query`.
///
/// Both lists must be free of duplicates. Two cursors advance over the lists;
/// runs missing from the query are removed and runs missing from the cache
/// inserted as single ranges. When both heads exist further on, the one that
/// is closer to its matching position is moved, so a single relocated row
/// costs one removal and one insertion.
pub fn synchronize(cache: &[ContactId], query: &[ContactId]) -> Vec<ListEdit> {
    let mut edits = Vec::new();
    let mut cache: Vec<ContactId> = cache.to_vec();
    let query_pos: HashMap<ContactId, usize> =
        query.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();
    let mut remaining: HashSet<ContactId> = cache.iter().copied().collect();

    let mut c = 0;
    let mut q = 0;
    while c < cache.len() && q < query.len() {
        let cache_id = cache[c];
        let query_id = query[q];

        if cache_id == query_id {
            remaining.remove(&cache_id);
            c += 1;
            q += 1;
            continue;
        }

        let cache_id_ahead = query_pos.get(&cache_id).copied().filter(|&pos| pos > q);
        let Some(query_pos_of_cache_id) = cache_id_ahead else {
            let mut end = c + 1;
            while end < cache.len()
                && !query_pos
                    .get(&cache[end])
                    .is_some_and(|&pos| pos >= q)
            {
                end += 1;
            }
            for id in &cache[c..end] {
                remaining.remove(id);
            }
            cache.drain(c..end);
            push_remove(&mut edits, c, end - c);
            continue;
        };

        if !remaining.contains(&query_id) {
            let mut end = q + 1;
            while end < query.len() && !remaining.contains(&query[end]) {
                end += 1;
            }
            let ids = query[q..end].to_vec();
            cache.splice(c..c, ids.iter().copied());
            edits.push(ListEdit::Insert { index: c, ids });
            c += end - q;
            q = end;
            continue;
        }

        // Both heads appear later in the other list.
        let Some(offset) = cache[c + 1..].iter().position(|id| *id == query_id) else {
            break;
        };
        let cache_distance = offset + 1;
        let query_distance = query_pos_of_cache_id - q;

        if cache_distance <= query_distance {
            remaining.remove(&cache_id);
            cache.remove(c);
            push_remove(&mut edits, c, 1);
        } else {
            let from = c + cache_distance;
            cache.remove(from);
            push_remove(&mut edits, from, 1);
            cache.insert(c, query_id);
            edits.push(ListEdit::Insert {
                index: c,
                ids: vec![query_id],
            });
            remaining.remove(&query_id);
            c += 1;
            q += 1;
        }
    }

    if c < cache.len() {
        let count = cache.len() - c;
        push_remove(&mut edits, c, count);
    }
    if q < query.len() {
        edits.push(ListEdit::Insert {
            index: c,
            ids: query[q..].to_vec(),
        });
    }
    edits
}

/// Removals at the same index in a row collapse into one ranged removal.
fn push_remove(edits: &mut Vec<ListEdit>, index: usize, count: usize) {
    if let Some(ListEdit::Remove {
        index: last,
        count: run,
    }) = edits.last_mut()
    {
        if *last == index {
            *run += count;
            return;
        }
    }
    edits.push(ListEdit::Remove { index, count });
}

#[derive(Debug, Default)]
pub(crate) struct ViewState {
    ids: Vec<ContactId>,
    /// Approximate positions, re-validated on access.
    positions: HashMap<ContactId, usize>,
    pub populated: bool,
}

impl ViewState {
    pub fn ids(&self) -> &[ContactId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn index_of(&mut self, id: ContactId) -> Option<usize> {
        if let Some(&pos) = self.positions.get(&id) {
            if self.ids.get(pos) == Some(&id) {
                return Some(pos);
            }
        }
        let pos = self.ids.iter().position(|candidate| *candidate == id)?;
        self.positions.insert(id, pos);
        Some(pos)
    }

    pub fn contains(&mut self, id: ContactId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn apply(&mut self, edit: &ListEdit) {
        match edit {
            ListEdit::Remove { index, count } => {
                for id in &self.ids[*index..*index + *count] {
                    self.positions.remove(id);
                }
            }
            ListEdit::Insert { index, ids } => {
                for (offset, id) in ids.iter().enumerate() {
                    self.positions.insert(*id, index + offset);
                }
            }
        }
        edit.apply(&mut self.ids);
    }
}
