//! Branch descriptors and the branch index.
//!
//! The index records, for any turn that has been edited or forked, the set of
//! sibling user-message variants at that position and which one came first.
//! The live list itself only ever holds the currently selected variant.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{BranchRef, Turn, TurnId};

/// A recorded alternative user message at a given history position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchDescriptor {
    pub id: TurnId,
    pub user_content: String,
    pub agent_id: String,
    pub created_at: SystemTime,
    pub is_original: bool,
}

impl BranchDescriptor {
    fn for_turn(turn: &Turn, is_original: bool) -> Self {
        Self {
            id: turn.id.clone(),
            user_content: turn.user.content.clone(),
            agent_id: turn.user.agent_id.clone(),
            created_at: turn.metadata.created_at,
            is_original,
        }
    }
}

/// Mapping from an origin turn id to its ordered branch descriptors.
///
/// Backed by a `BTreeMap` so the serialized form is deterministic. There is
/// no lazy computation: the serialized form is the plain mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchIndex {
    origins: BTreeMap<TurnId, Vec<BranchDescriptor>>,
}

impl BranchIndex {
    /// Record `new_turn` as a branch of `origin`.
    ///
    /// The first call for a given origin retroactively snapshots the origin's
    /// pre-branch state as descriptor 0 with `is_original = true`, so the
    /// original path is never silently lost. Sets `new_turn`'s branch ref to
    /// its position in the descriptor sequence.
    pub fn record_branch(&mut self, origin: &Turn, new_turn: &mut Turn) {
        let descriptors = self.origins.entry(origin.id.clone()).or_default();
        if descriptors.is_empty() {
            descriptors.push(BranchDescriptor::for_turn(origin, true));
        }
        descriptors.push(BranchDescriptor::for_turn(new_turn, false));
        new_turn.metadata.branch_ref = Some(BranchRef {
            parent_turn_id: origin.id.clone(),
            branch_index: descriptors.len() - 1,
        });
    }

    /// Descriptors recorded for `turn_id`, empty if it was never branched.
    #[must_use]
    pub fn descriptors_for(&self, turn_id: &TurnId) -> &[BranchDescriptor] {
        self.origins.get(turn_id).map_or(&[], Vec::as_slice)
    }

    /// A turn has branches once more than one variant exists at its position.
    #[must_use]
    pub fn has_branches(&self, turn_id: &TurnId) -> bool {
        self.descriptors_for(turn_id).len() > 1
    }

    #[must_use]
    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn clear(&mut self) {
        self.origins.clear();
    }
}
