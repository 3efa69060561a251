//! Byte-range partitioning for parallel chunked transfers.

/// Inclusive byte range `[from, to]` within the remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub from: u64,
    pub to: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Split `[0, total_len - 1]` into up to `requested` contiguous,
/// non-overlapping ranges of size `ceil(total_len / requested)`. Fewer ranges
/// come back when the object is smaller than the requested count; an empty
/// object yields no ranges.
pub fn plan_chunks(total_len: u64, requested: usize) -> Vec<ByteRange> {
    if total_len == 0 {
        return Vec::new();
    }
    let n = (requested.max(1) as u64).min(total_len);
    let size = total_len.div_ceil(n);

    let mut ranges = Vec::with_capacity(n as usize);
    let mut from = 0u64;
    while from < total_len {
        let to = (from + size - 1).min(total_len - 1);
        ranges.push(ByteRange { from, to });
        from = to + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partitions(total: u64, ranges: &[ByteRange]) {
        assert_eq!(ranges[0].from, 0);
        assert_eq!(ranges.last().unwrap().to, total - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].to + 1, pair[1].from, "gap or overlap");
        }
        let covered: u64 = ranges.iter().map(ByteRange::len).sum();
        assert_eq!(covered, total);
    }

    #[test]
    fn even_split() {
        let ranges = plan_chunks(100, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0], ByteRange { from: 0, to: 24 });
        assert_eq!(ranges[3], ByteRange { from: 75, to: 99 });
        assert_partitions(100, &ranges);
    }

    #[test]
    fn uneven_split_short_last_chunk() {
        let ranges = plan_chunks(10, 3);
        // ceil(10/3) = 4 per chunk, last one truncated.
        assert_eq!(
            ranges,
            vec![
                ByteRange { from: 0, to: 3 },
                ByteRange { from: 4, to: 7 },
                ByteRange { from: 8, to: 9 },
            ]
        );
        assert_partitions(10, &ranges);
    }

    #[test]
    fn more_chunks_than_bytes() {
        let ranges = plan_chunks(3, 8);
        assert_eq!(ranges.len(), 3);
        assert_partitions(3, &ranges);
    }

    #[test]
    fn single_chunk_spans_everything() {
        let ranges = plan_chunks(1234, 1);
        assert_eq!(ranges, vec![ByteRange { from: 0, to: 1233 }]);
    }

    #[test]
    fn empty_object_yields_nothing() {
        assert!(plan_chunks(0, 4).is_empty());
    }
}
