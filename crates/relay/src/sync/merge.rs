// Server-side CRDT replica for one document.

use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed update: {reason}")]
pub struct MalformedUpdate {
    reason: String,
}

impl MalformedUpdate {
    fn new(reason: impl std::fmt::Display) -> Self {
        Self { reason: reason.to_string() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// False when the update was already fully integrated, or is still
    /// waiting on updates it depends on.
    pub changed: bool,
}

/// Authoritative replica held by a session. Merging is commutative,
/// associative and idempotent, so replicas that saw the same set of updates
/// converge regardless of delivery order.
pub struct DocumentReplica {
    doc: Doc,
}

impl DocumentReplica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Rebuilds a replica from a persisted full state.
    pub fn from_state(state: &[u8]) -> Result<Self, MalformedUpdate> {
        let replica = Self::new();
        replica.apply(state)?;
        Ok(replica)
    }

    /// Checks that `payload` decodes as an update without touching the
    /// replica.
    pub fn validate(payload: &[u8]) -> Result<(), MalformedUpdate> {
        decode(payload).map(|_| ())
    }

    pub fn apply(&self, payload: &[u8]) -> Result<MergeOutcome, MalformedUpdate> {
        let update = decode(payload)?;

        let before = self.doc.transact().snapshot();
        self.doc.transact_mut().apply_update(update).map_err(MalformedUpdate::new)?;
        let after = self.doc.transact().snapshot();

        Ok(MergeOutcome { changed: before != after })
    }

    /// Full state as a single update, suitable both for persistence and as
    /// a baseline for newly admitted clients.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn text(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        text.get_string(&self.doc.transact())
    }
}

impl Default for DocumentReplica {
    fn default() -> Self {
        Self::new()
    }
}

fn decode(payload: &[u8]) -> Result<Update, MalformedUpdate> {
    if payload.is_empty() {
        return Err(MalformedUpdate::new("empty payload"));
    }
    Update::decode_v1(payload).map_err(MalformedUpdate::new)
}
