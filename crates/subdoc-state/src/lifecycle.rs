//! Per-fragment lifecycle state.
//!
//! A fragment moves between four states based on where its data came from
//! and whether local edits are pending. Events that have no transition for
//! the current state are inert, never an error.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lifecycle state of a fragment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Freshly constructed, no data yet.
    #[default]
    Empty,
    /// Given locally-originated data; no canonical counterpart exists yet.
    Created,
    /// In sync with canonical data from an authority.
    Saved,
    /// Canonical data exists and local edits are pending.
    Updated,
}

/// Events that drive lifecycle transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Locally-originated data arrived (fragment built from caller attrs).
    LoadedData,
    /// Authoritative data arrived (initial load or pushed refresh).
    PushedData,
    /// A mutation made the fragment dirty.
    MutationDirtied,
    /// A save completed and was accepted.
    DidCommit,
    /// Working state was restored to canonical.
    RolledBack,
}

impl LifecycleState {
    /// Apply an event, returning the resulting state.
    ///
    /// Pairs without a transition return the current state unchanged.
    #[must_use]
    pub fn apply(self, event: LifecycleEvent) -> LifecycleState {
        use LifecycleEvent::*;
        use LifecycleState::*;

        let next = match (self, event) {
            (Empty, LoadedData) => Created,
            (Empty, PushedData) => Saved,
            (Created, MutationDirtied) => Created,
            (Created, DidCommit) => Saved,
            (Saved, PushedData) => Saved,
            (Saved, MutationDirtied) => Updated,
            (Saved, DidCommit) => Saved,
            (Updated, MutationDirtied) => Updated,
            (Updated, DidCommit) => Saved,
            (Updated, RolledBack) => Saved,
            (current, _) => current,
        };

        if next != self {
            debug!(from = ?self, to = ?next, ?event, "lifecycle transition");
        }
        next
    }

    /// Whether this fragment has never been committed to an authority.
    pub fn is_new(self) -> bool {
        matches!(self, LifecycleState::Empty | LifecycleState::Created)
    }
}
