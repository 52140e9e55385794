//! Export/import history snapshot.

use serde::{Deserialize, Serialize};

use crate::{BranchIndex, Turn};

/// Full serializable view of a session: the live turn list and the branch
/// index. `import(export())` must reproduce an equivalent session, turn ids
/// and branch descriptors preserved byte-for-byte.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub branches: BranchIndex,
}
