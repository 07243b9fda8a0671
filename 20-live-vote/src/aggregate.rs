use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    counter::parse_count,
    error::VoteError,
    keys::{trailing_segment, Keyspace, SessionId},
    store::KvStore,
};

/// Current count per option id, rebuilt from the store on every request.
///
/// Serializes as a flat JSON object: `{"1": 3, "2": 0}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultsSnapshot(pub BTreeMap<String, u64>);

impl ResultsSnapshot {
    pub fn get(&self, option: &str) -> Option<u64> {
        self.0.get(option).copied()
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

/// Reads every counter under the session's results prefix in one scan.
///
/// A session with no counters yields an empty snapshot; existence checks belong
/// to the caller.
pub async fn aggregate(
    store: &dyn KvStore,
    keys: &Keyspace,
    session: &SessionId,
) -> Result<ResultsSnapshot, VoteError> {
    let counters = store.get_prefix(&keys.results_prefix(session)).await?;

    let mut results = BTreeMap::new();
    for (key, raw) in counters {
        let count = parse_count(&key, &raw)?;
        results.insert(trailing_segment(&key).to_string(), count);
    }
    Ok(ResultsSnapshot(results))
}
