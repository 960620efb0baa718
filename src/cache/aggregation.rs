//! Merge and split planning for aggregate contacts.
//!
//! Merging B into A moves every constituent of B under A. Both constituent
//! sets must have been fetched first; a [`LinkRequest`] tracks that.

use crate::contact::{Contact, ContactId, SyncTarget};
use crate::store::Relationship;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinkRequest {
    pub target: ContactId,
    pub source: ContactId,
    target_ready: bool,
    source_ready: bool,
}

#[derive(Debug, Default)]
pub(crate) struct LinkQueue {
    pending: Vec<LinkRequest>,
}

impl LinkQueue {
    pub fn push(&mut self, target: ContactId, source: ContactId) {
        self.pending.push(LinkRequest {
            target,
            source,
            target_ready: false,
            source_ready: false,
        });
    }

    /// Record that `anchor`'s constituents are known. Returns the requests
    /// that became ready, removing them from the queue.
    pub fn constituents_known(&mut self, anchor: ContactId) -> Vec<LinkRequest> {
        for request in &mut self.pending {
            if request.target == anchor {
                request.target_ready = true;
            }
            if request.source == anchor {
                request.source_ready = true;
            }
        }

        let (ready, waiting): (Vec<LinkRequest>, Vec<LinkRequest>) = self
            .pending
            .drain(..)
            .partition(|request| request.target_ready && request.source_ready);
        self.pending = waiting;
        ready
    }
}

/// Store operations that carry out a merge.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct MergePlan {
    /// Local constituent of the source demoted to `WasLocal`.
    pub demote: Option<Contact>,
    pub link: Vec<Relationship>,
    pub unlink: Vec<Relationship>,
}

fn is_local(contact: &Contact) -> bool {
    contact.sync_target == Some(SyncTarget::Local)
}

/// Plan the merge of `source` into `target`, given their constituents.
///
/// An aggregate keeps at most one local constituent: when both sides have
/// one, the source's is demoted before being moved.
pub(crate) fn plan_merge(
    target: ContactId,
    target_constituents: &[Contact],
    source: ContactId,
    source_constituents: &[Contact],
) -> MergePlan {
    let mut plan = MergePlan::default();

    if target_constituents.iter().any(is_local) {
        if let Some(local) = source_constituents.iter().find(|c| is_local(c)) {
            let mut demoted = local.clone();
            demoted.sync_target = Some(SyncTarget::WasLocal);
            plan.demote = Some(demoted);
        }
    }

    for constituent in source_constituents {
        plan.link.push(Relationship::aggregates(target, constituent.id));
        plan.unlink.push(Relationship::aggregates(source, constituent.id));
    }
    plan
}

/// Store operations that carry out a split.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct SplitPlan {
    pub link: Vec<Relationship>,
    pub unlink: Vec<Relationship>,
    /// A previously demoted constituent regaining its local status.
    pub restore: Option<Contact>,
}

pub(crate) fn plan_split(
    aggregate: ContactId,
    constituent_id: ContactId,
    constituent: Option<&Contact>,
) -> SplitPlan {
    let restore = constituent
        .filter(|c| c.sync_target == Some(SyncTarget::WasLocal))
        .map(|c| {
            let mut restored = c.clone();
            restored.sync_target = Some(SyncTarget::Local);
            restored
        });

    SplitPlan {
        link: vec![Relationship::is_not(aggregate, constituent_id)],
        unlink: vec![Relationship::aggregates(aggregate, constituent_id)],
        restore,
    }
}
