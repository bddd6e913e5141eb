// Fixed-size chunk layout for a file of known length.
// The blob channel caps one message a little under 50MB, so the default leaves headroom.

use serde::{Deserialize, Serialize};

use crate::{DavError, DavResult};

/// 49.9 MiB, truncated to whole bytes.
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 52_323_942;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub seq: u32,
    pub size: u64,
    pub offset: u64,
}

impl ChunkPlan {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

fn check_params(total_size: i64, max_chunk_size: u64) -> DavResult<u64> {
    if total_size < 0 {
        return Err(DavError::InvalidInput(format!(
            "invalid file size: {}",
            total_size
        )));
    }
    if max_chunk_size == 0 {
        return Err(DavError::InvalidInput(
            "max chunk size must be positive".to_string(),
        ));
    }
    Ok(total_size as u64)
}

/// Number of chunks a file of `total_size` bytes is split into. An empty file still has one.
pub fn chunk_count(total_size: i64, max_chunk_size: u64) -> DavResult<u32> {
    let total = check_params(total_size, max_chunk_size)?;
    if total == 0 {
        return Ok(1);
    }
    let count = (total + max_chunk_size - 1) / max_chunk_size;
    u32::try_from(count).map_err(|_| {
        DavError::InvalidInput(format!(
            "file size {} needs too many chunks ({})",
            total, count
        ))
    })
}

pub fn plan_chunks(total_size: i64, max_chunk_size: u64) -> DavResult<Vec<ChunkPlan>> {
    let count = chunk_count(total_size, max_chunk_size)?;
    let total = total_size as u64;

    let mut plans = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    for seq in 0..count {
        let size = max_chunk_size.min(total - offset);
        plans.push(ChunkPlan { seq, size, offset });
        offset += size;
    }
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_layout(total: u64, max: u64) {
        let plans = plan_chunks(total as i64, max).unwrap();
        assert!(!plans.is_empty());
        assert_eq!(plans.iter().map(|p| p.size).sum::<u64>(), total);
        let mut expect_offset = 0;
        for (idx, plan) in plans.iter().enumerate() {
            assert_eq!(plan.seq as usize, idx);
            assert_eq!(plan.offset, expect_offset);
            assert!(plan.size <= max);
            if idx + 1 < plans.len() {
                assert_eq!(plan.size, max);
            }
            expect_offset = plan.end();
        }
    }

    #[test]
    fn test_plan_boundaries() {
        let m = 1000u64;
        for total in [0, 1, m - 1, m, m + 1, 2 * m, 5 * m + 7, 123_457] {
            check_layout(total, m);
        }
    }

    #[test]
    fn test_plan_empty_file_has_one_chunk() {
        let plans = plan_chunks(0, DEFAULT_MAX_CHUNK_SIZE).unwrap();
        assert_eq!(
            plans,
            vec![ChunkPlan {
                seq: 0,
                size: 0,
                offset: 0
            }]
        );
    }

    #[test]
    fn test_plan_last_chunk_size() {
        let plans = plan_chunks(5 * 1000 + 7, 1000).unwrap();
        assert_eq!(plans.len(), 6);
        assert_eq!(plans[5].size, 7);
        assert_eq!(plans[5].offset, 5000);

        let plans = plan_chunks(3000, 1000).unwrap();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[2].size, 1000);
    }

    #[test]
    fn test_plan_120mb_with_default_size() {
        let total = 120 * 1024 * 1024i64;
        assert_eq!(DEFAULT_MAX_CHUNK_SIZE, (49.9f64 * 1024.0 * 1024.0) as u64);
        let plans = plan_chunks(total, DEFAULT_MAX_CHUNK_SIZE).unwrap();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].size, 52_323_942);
        assert_eq!(plans[1].size, 52_323_942);
        assert_eq!(plans[2].size, 21_181_236);
        assert_eq!(plans[2].offset, 104_647_884);
    }

    #[test]
    fn test_plan_invalid_input() {
        assert!(matches!(
            plan_chunks(-1, 1000),
            Err(DavError::InvalidInput(_))
        ));
        assert!(matches!(plan_chunks(10, 0), Err(DavError::InvalidInput(_))));
        assert_eq!(chunk_count(0, 10).unwrap(), 1);
        assert_eq!(chunk_count(25, 10).unwrap(), 3);
    }
}
