use crate::error::DbError;
use crate::filter::TimeFilter;
use crate::merge::GroupCursor;
use crate::selector::{select, ChunkSet};
use crate::types::Point;

/// Reads every visible point of `set` that satisfies `filter`, in ascending timestamp order.
///
/// Overlap groups are disjoint in time and come back from the selector ordered by start, so
/// concatenating the per-group streams keeps the output sorted. Where chunks overlap, the
/// value from the highest version wins.
///
/// # Arguments
/// * `set` - Snapshot of the series' chunks.
/// * `filter` - Closed time predicate.
/// * `direct_singletons` - Read single-chunk groups without the merge iterator.
///
/// # Errors
/// A decode or integrity error in any chunk aborts the scan; no partial result is returned.
pub fn execute_query(
    set: &ChunkSet,
    filter: &TimeFilter,
    direct_singletons: bool,
) -> Result<Vec<Point>, DbError> {
    let mut out = Vec::new();
    for group in select(set, filter) {
        let cursor = GroupCursor::open(set, &group, filter, direct_singletons)?;
        for item in cursor {
            let p = item?;
            if filter.satisfies(p.timestamp) {
                out.push(p);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::types::{ChunkKind, Timestamp, Value, Version};
    use std::sync::Arc;

    fn chunk(kind: ChunkKind, version: Version, points: &[(Timestamp, i64)]) -> Arc<Chunk> {
        let points: Vec<Point> = points
            .iter()
            .map(|&(t, v)| Point::new(t, Value::Int64(v)))
            .collect();
        Arc::new(Chunk::encode("q", kind, version, &points).unwrap())
    }

    fn layered() -> ChunkSet {
        ChunkSet::new(
            "q",
            vec![
                chunk(ChunkKind::Sequential, 1, &[(1, 10), (2, 20), (3, 30)]),
                chunk(ChunkKind::Sequential, 4, &[(10, 100), (11, 110)]),
            ],
            vec![
                chunk(ChunkKind::Unsequential, 2, &[(2, 21), (4, 41)]),
                chunk(ChunkKind::Unsequential, 3, &[(3, 31)]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn query_merges_groups_in_order() {
        let set = layered();
        let points = execute_query(&set, &TimeFilter::all(), true).unwrap();
        let got: Vec<(Timestamp, Value)> = points.iter().map(|p| (p.timestamp, p.value)).collect();
        assert_eq!(
            got,
            vec![
                (1, Value::Int64(10)),
                (2, Value::Int64(21)),
                (3, Value::Int64(31)),
                (4, Value::Int64(41)),
                (10, Value::Int64(100)),
                (11, Value::Int64(110)),
            ]
        );
        assert_eq!(set.handles().live(), 0);
    }

    #[test]
    fn query_respects_filter_bounds() {
        let set = layered();
        let points = execute_query(&set, &TimeFilter::between(2, 10), false).unwrap();
        let ts: Vec<Timestamp> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![2, 3, 4, 10]);

        assert!(execute_query(&set, &TimeFilter::gt(11), true).unwrap().is_empty());
    }

    #[test]
    fn direct_and_merged_reads_agree() {
        let set = layered();
        let filter = TimeFilter::lt(11);
        assert_eq!(
            execute_query(&set, &filter, true).unwrap(),
            execute_query(&set, &filter, false).unwrap()
        );
    }
}
