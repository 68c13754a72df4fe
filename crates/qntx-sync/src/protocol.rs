//! Wire shapes for the reconciliation protocol (spec §4.8).
//!
//! The spec deliberately doesn't prescribe framing ("not prescribing wire
//! framing"); this is one concrete, symmetric choice — both the outbound
//! ticker and the inbound `/ws/sync` handler in `qntx-server` speak the
//! same `SyncFrame` sequence, so either side can initiate.

use std::collections::BTreeMap;

use qntx_core::model::Attestation;
use serde::{Deserialize, Serialize};

use crate::hashtree::HashTree;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub root_hash: String,
    /// group_key -> group_hash (member IDs withheld until a group is known
    /// to differ, spec §4.8 "on mismatch, the leaf IDs in that group").
    pub group_hashes: BTreeMap<String, String>,
}

impl From<&HashTree> for SyncSummary {
    fn from(tree: &HashTree) -> Self {
        Self {
            root_hash: tree.root_hash.clone(),
            group_hashes: tree.groups.iter().map(|(k, v)| (k.clone(), v.hash.clone())).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SyncFrame {
    Summary(SyncSummary),
    /// Member IDs for the groups the sender believes differ.
    GroupIds(BTreeMap<String, Vec<String>>),
    Fetch { ids: Vec<String> },
    Attestations { items: Vec<Attestation> },
    Budget { spend: f64, limit: f64 },
}
