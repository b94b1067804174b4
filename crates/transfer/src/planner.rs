//! Splits a byte range into chunk-sized pieces.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use blobxfer_protocol::blocks::encode_block_id;

use crate::blocks::BlockIndexMap;
use crate::error::TransferError;

/// Half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// One planned unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRange {
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    /// Upload block id. Always `None` for downloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    pub sequence_index: usize,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn byte_range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }
}

/// Produces ordered, gap-free chunk plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    chunk_size: u64,
}

impl ChunkPlanner {
    pub fn new(chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::Planning("chunk size must be positive".into()));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Plans `[range_offset, range_offset + range_length)`, clipped to `total_size`.
    ///
    /// With an unknown total a single provisional chunk is returned; the
    /// remainder is planned once the first response reveals the size.
    /// `range_length = None` means "to the end of the object".
    pub fn plan(
        &self,
        total_size: Option<u64>,
        range_offset: u64,
        range_length: Option<u64>,
    ) -> Vec<ChunkRange> {
        if range_length == Some(0) {
            return Vec::new();
        }
        match total_size {
            None => {
                let len = range_length.map_or(self.chunk_size, |l| l.min(self.chunk_size));
                vec![ChunkRange {
                    start: range_offset,
                    end: range_offset.saturating_add(len),
                    block_id: None,
                    sequence_index: 0,
                }]
            }
            Some(total) => {
                let limit = match range_length {
                    Some(len) => range_offset.saturating_add(len).min(total),
                    None => total,
                };
                self.plan_span(range_offset, limit, 0)
            }
        }
    }

    /// Plans `[start, end)` with sequence indices starting at `first_index`.
    pub fn plan_span(&self, start: u64, end: u64, first_index: usize) -> Vec<ChunkRange> {
        let mut chunks = Vec::new();
        let mut offset = start;
        while offset < end {
            let chunk_end = offset.saturating_add(self.chunk_size).min(end);
            chunks.push(ChunkRange {
                start: offset,
                end: chunk_end,
                block_id: None,
                sequence_index: first_index + chunks.len(),
            });
            offset = chunk_end;
        }
        chunks
    }

    /// Plans an upload of a `file_size`-byte file, minting one block id per chunk.
    pub fn plan_upload(&self, file_size: u64) -> (Vec<ChunkRange>, BlockIndexMap) {
        let mut blocks = BlockIndexMap::default();
        let chunks = self
            .plan_span(0, file_size, 0)
            .into_iter()
            .map(|mut chunk| {
                let id = encode_block_id(&Uuid::new_v4());
                blocks.insert_planned(id.clone(), chunk.sequence_index);
                chunk.block_id = Some(id);
                chunk
            })
            .collect();
        (chunks, blocks)
    }
}

/// Rejects download requests that can never be satisfied.
pub fn validate_range_request(
    range_offset: u64,
    range_length: Option<u64>,
) -> Result<(), TransferError> {
    match range_length {
        Some(0) => Err(TransferError::Planning("requested range length is zero".into())),
        Some(len) if range_offset.checked_add(len).is_none() => Err(TransferError::Planning(
            format!("range {range_offset}+{len} overflows"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;

    fn spans(chunks: &[ChunkRange]) -> Vec<(u64, u64)> {
        chunks.iter().map(|c| (c.start, c.end)).collect()
    }

    #[test]
    fn ten_mb_in_four_mb_chunks() {
        let planner = ChunkPlanner::new(4 * MB).unwrap();
        let plan = planner.plan(Some(10 * MB), 0, None);
        assert_eq!(
            spans(&plan),
            vec![(0, 4 * MB), (4 * MB, 8 * MB), (8 * MB, 10 * MB)]
        );
        let indices: Vec<_> = plan.iter().map(|c| c.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let planner = ChunkPlanner::new(4).unwrap();
        assert_eq!(spans(&planner.plan(Some(8), 0, None)), vec![(0, 4), (4, 8)]);
    }

    #[test]
    fn ranged_request_is_clipped_to_total() {
        let planner = ChunkPlanner::new(4).unwrap();
        assert_eq!(
            spans(&planner.plan(Some(10), 3, Some(100))),
            vec![(3, 7), (7, 10)]
        );
        assert_eq!(spans(&planner.plan(Some(10), 2, Some(3))), vec![(2, 5)]);
    }

    #[test]
    fn empty_inputs_plan_nothing() {
        let planner = ChunkPlanner::new(4).unwrap();
        assert!(planner.plan(Some(0), 0, None).is_empty());
        assert!(planner.plan(Some(10), 0, Some(0)).is_empty());
        assert!(planner.plan(Some(10), 10, None).is_empty());
        assert!(planner.plan(None, 0, Some(0)).is_empty());
    }

    #[test]
    fn unknown_total_plans_provisional_chunk() {
        let planner = ChunkPlanner::new(4).unwrap();
        assert_eq!(spans(&planner.plan(None, 0, None)), vec![(0, 4)]);
        assert_eq!(spans(&planner.plan(None, 5, Some(2))), vec![(5, 7)]);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(matches!(
            ChunkPlanner::new(0),
            Err(TransferError::Planning(_))
        ));
    }

    #[test]
    fn plans_cover_range_without_gaps() {
        for chunk_size in [1u64, 3, 7, 64] {
            let planner = ChunkPlanner::new(chunk_size).unwrap();
            for total in [1u64, 2, 63, 64, 65, 200] {
                for offset in [0u64, 1, 5] {
                    for length in [None, Some(1), Some(10), Some(1000)] {
                        let plan = planner.plan(Some(total), offset, length);
                        let want_end = length.map_or(total, |l| (offset + l).min(total));
                        if offset >= want_end {
                            assert!(plan.is_empty());
                            continue;
                        }
                        assert_eq!(plan.first().unwrap().start, offset);
                        assert_eq!(plan.last().unwrap().end, want_end);
                        for pair in plan.windows(2) {
                            assert_eq!(pair[0].end, pair[1].start);
                        }
                        assert!(plan.iter().all(|c| c.len() <= chunk_size && !c.is_empty()));
                    }
                }
            }
        }
    }

    #[test]
    fn plan_span_continues_indices() {
        let planner = ChunkPlanner::new(4).unwrap();
        let plan = planner.plan_span(4, 10, 1);
        assert_eq!(spans(&plan), vec![(4, 8), (8, 10)]);
        assert_eq!(plan[0].sequence_index, 1);
        assert_eq!(plan[1].sequence_index, 2);
    }

    #[test]
    fn upload_plan_mints_unique_block_ids() {
        let planner = ChunkPlanner::new(4).unwrap();
        let (plan, blocks) = planner.plan_upload(10);
        assert_eq!(plan.len(), 3);
        assert_eq!(blocks.planned_len(), 3);

        let ids: std::collections::HashSet<_> =
            plan.iter().map(|c| c.block_id.clone().unwrap()).collect();
        assert_eq!(ids.len(), 3);
        for chunk in &plan {
            let id = chunk.block_id.as_deref().unwrap();
            assert_eq!(blocks.planned_index(id), Some(chunk.sequence_index));
        }
    }

    #[test]
    fn empty_upload_plans_no_blocks() {
        let planner = ChunkPlanner::new(4).unwrap();
        let (plan, blocks) = planner.plan_upload(0);
        assert!(plan.is_empty());
        assert!(blocks.is_fully_completed());
    }

    #[test]
    fn range_request_validation() {
        assert!(validate_range_request(0, None).is_ok());
        assert!(validate_range_request(10, Some(5)).is_ok());
        assert!(validate_range_request(0, Some(0)).is_err());
        assert!(validate_range_request(u64::MAX, Some(2)).is_err());
    }
}
