use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Tracks upload block ids: which were planned at which position, and
/// which the service has acknowledged.
///
/// The commit list is rebuilt from this map, so completion order never
/// affects the order of the committed blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockIndexMap {
    planned: BTreeMap<String, usize>,
    completed: BTreeMap<String, usize>,
}

impl BlockIndexMap {
    pub fn insert_planned(&mut self, block_id: String, sequence_index: usize) {
        self.planned.insert(block_id, sequence_index);
    }

    pub fn planned_index(&self, block_id: &str) -> Option<usize> {
        self.planned.get(block_id).copied()
    }

    /// Records that a block was staged. Idempotent.
    pub fn mark_completed(&mut self, block_id: &str) -> Result<usize, TransferError> {
        let index = self
            .planned_index(block_id)
            .ok_or_else(|| TransferError::NotFound(format!("block id {block_id} was never planned")))?;
        self.completed.insert(block_id.to_string(), index);
        Ok(index)
    }

    pub fn is_completed(&self, block_id: &str) -> bool {
        self.completed.contains_key(block_id)
    }

    pub fn planned_len(&self) -> usize {
        self.planned.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_fully_completed(&self) -> bool {
        self.planned.keys().all(|id| self.completed.contains_key(id))
    }

    /// Block ids in planned order, ready for the block-list commit.
    pub fn commit_order(&self) -> Result<Vec<String>, TransferError> {
        if !self.is_fully_completed() {
            return Err(TransferError::IncompleteBlockList {
                completed: self.completed_len(),
                planned: self.planned_len(),
            });
        }
        let mut ids: Vec<(&String, &usize)> = self.completed.iter().collect();
        ids.sort_by_key(|(_, index)| **index);
        Ok(ids.into_iter().map(|(id, _)| id.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(ids: &[&str]) -> BlockIndexMap {
        let mut map = BlockIndexMap::default();
        for (i, id) in ids.iter().enumerate() {
            map.insert_planned(id.to_string(), i);
        }
        map
    }

    #[test]
    fn commit_order_follows_plan_not_completion() {
        let mut map = map_with(&["zz", "aa", "mm"]);
        map.mark_completed("mm").unwrap();
        map.mark_completed("zz").unwrap();
        map.mark_completed("aa").unwrap();
        assert_eq!(map.commit_order().unwrap(), vec!["zz", "aa", "mm"]);
    }

    #[test]
    fn commit_requires_every_block() {
        let mut map = map_with(&["a", "b"]);
        map.mark_completed("a").unwrap();
        assert!(!map.is_fully_completed());
        assert!(matches!(
            map.commit_order(),
            Err(TransferError::IncompleteBlockList {
                completed: 1,
                planned: 2
            })
        ));
    }

    #[test]
    fn unknown_block_is_rejected() {
        let mut map = map_with(&["a"]);
        assert!(matches!(
            map.mark_completed("nope"),
            Err(TransferError::NotFound(_))
        ));
        assert_eq!(map.completed_len(), 0);
    }

    #[test]
    fn marking_twice_is_idempotent() {
        let mut map = map_with(&["a"]);
        map.mark_completed("a").unwrap();
        map.mark_completed("a").unwrap();
        assert_eq!(map.completed_len(), 1);
        assert!(map.is_completed("a"));
    }

    #[test]
    fn survives_json_roundtrip() {
        let mut map = map_with(&["a", "b"]);
        map.mark_completed("b").unwrap();
        let json = serde_json::to_string(&map).unwrap();
        let back: BlockIndexMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
