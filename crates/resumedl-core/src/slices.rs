//! Slice ledger algorithms
//!
//! The ledger is a `Vec<ReceivedSlice>` kept sorted by offset, where no two
//! entries overlap or touch.

use resumedl_types::{ReceivedSlice, SliceToDownload};

/// Compute the byte ranges that are not in `received_slices` yet.
///
/// The last entry is always open-ended: it runs from the last known byte to
/// the end of the file, whose length is not known here.
pub fn find_slices_to_download(received_slices: &[ReceivedSlice]) -> Vec<SliceToDownload> {
    let mut result = Vec::new();
    let Some(first) = received_slices.first() else {
        result.push(SliceToDownload::open(0));
        return result;
    };

    if first.offset != 0 {
        result.push(SliceToDownload::new(0, Some(first.offset)));
    }

    for pair in received_slices.windows(2) {
        let end = pair[0].end();
        let next = pair[1].offset;
        if next > end {
            result.push(SliceToDownload::new(end, Some(next - end)));
        }
    }

    // The ledger is non-empty, so there is a last slice.
    let tail = received_slices[received_slices.len() - 1].end();
    result.push(SliceToDownload::open(tail));
    result
}

/// Insert `new_slice` into the sorted ledger, merging it with every entry it
/// touches or overlaps.
///
/// Returns the index of the slice that now contains `new_slice.offset`.
pub fn add_or_merge_received_slice_into_sorted_array(
    new_slice: ReceivedSlice,
    received_slices: &mut Vec<ReceivedSlice>,
) -> usize {
    let start = new_slice.offset;
    let end = new_slice.end();

    // First entry whose end reaches `start`: everything before it is strictly
    // left of the new slice with a gap in between.
    let first = received_slices.partition_point(|s| s.end() < start);
    // First entry starting strictly after `end`.
    let last = received_slices.partition_point(|s| s.offset <= end);

    if first >= last {
        if new_slice.length > 0 {
            received_slices.insert(first, new_slice);
        }
        return first;
    }

    let merged_start = start.min(received_slices[first].offset);
    let merged_end = end.max(received_slices[last - 1].end());
    received_slices[first] = ReceivedSlice::new(merged_start, merged_end - merged_start);
    received_slices.drain(first + 1..last);
    first
}

/// Total number of bytes recorded in the ledger.
pub fn total_received(received_slices: &[ReceivedSlice]) -> u64 {
    received_slices.iter().map(|s| s.length).sum()
}

/// Index of the slice containing `offset`, if any.
pub fn slice_index_containing(received_slices: &[ReceivedSlice], offset: u64) -> Option<usize> {
    let index = received_slices.partition_point(|s| s.end() <= offset);
    received_slices
        .get(index)
        .filter(|s| s.offset <= offset && offset < s.end())
        .map(|_| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(offset: u64, length: u64) -> ReceivedSlice {
        ReceivedSlice::new(offset, length)
    }

    fn assert_well_formed(ledger: &[ReceivedSlice]) {
        for pair in ledger.windows(2) {
            assert!(
                pair[0].end() < pair[1].offset,
                "slices {:?} and {:?} overlap or touch",
                pair[0],
                pair[1]
            );
        }
        assert!(ledger.iter().all(|s| s.length > 0));
    }

    #[test]
    fn test_find_slices_empty_ledger() {
        assert_eq!(find_slices_to_download(&[]), vec![SliceToDownload::open(0)]);
    }

    #[test]
    fn test_find_slices_with_holes() {
        let ledger = vec![slice(10, 10), slice(50, 5)];
        assert_eq!(
            find_slices_to_download(&ledger),
            vec![
                SliceToDownload::new(0, Some(10)),
                SliceToDownload::new(20, Some(30)),
                SliceToDownload::open(55),
            ]
        );
    }

    #[test]
    fn test_find_slices_starting_at_zero() {
        let ledger = vec![slice(0, 100)];
        assert_eq!(find_slices_to_download(&ledger), vec![SliceToDownload::open(100)]);
    }

    #[test]
    fn test_merge_into_empty() {
        let mut ledger = Vec::new();
        assert_eq!(add_or_merge_received_slice_into_sorted_array(slice(5, 10), &mut ledger), 0);
        assert_eq!(ledger, vec![slice(5, 10)]);
    }

    #[test]
    fn test_merge_extends_preceding_contiguous_slice() {
        let mut ledger = vec![slice(0, 100), slice(300, 10)];
        let index = add_or_merge_received_slice_into_sorted_array(slice(100, 50), &mut ledger);
        assert_eq!(index, 0);
        assert_eq!(ledger, vec![slice(0, 150), slice(300, 10)]);
    }

    #[test]
    fn test_merge_inserts_in_order() {
        let mut ledger = vec![slice(0, 10), slice(100, 10)];
        let index = add_or_merge_received_slice_into_sorted_array(slice(50, 10), &mut ledger);
        assert_eq!(index, 1);
        assert_eq!(ledger, vec![slice(0, 10), slice(50, 10), slice(100, 10)]);

        let index = add_or_merge_received_slice_into_sorted_array(slice(200, 1), &mut ledger);
        assert_eq!(index, 3);
    }

    #[test]
    fn test_merge_bridges_two_slices() {
        let mut ledger = vec![slice(0, 10), slice(20, 10)];
        let index = add_or_merge_received_slice_into_sorted_array(slice(10, 10), &mut ledger);
        assert_eq!(index, 0);
        assert_eq!(ledger, vec![slice(0, 30)]);
    }

    #[test]
    fn test_merge_touching_following_slice() {
        let mut ledger = vec![slice(500, 100)];
        let index = add_or_merge_received_slice_into_sorted_array(slice(0, 500), &mut ledger);
        assert_eq!(index, 0);
        assert_eq!(ledger, vec![slice(0, 600)]);
    }

    #[test]
    fn test_merge_covered_length() {
        let cases: Vec<(Vec<ReceivedSlice>, ReceivedSlice)> = vec![
            (vec![slice(0, 10), slice(20, 10)], slice(5, 20)),
            (vec![slice(0, 10), slice(40, 10)], slice(15, 5)),
            (vec![slice(10, 10)], slice(0, 100)),
            (vec![slice(0, 10), slice(11, 1), slice(13, 7)], slice(9, 3)),
            (vec![], slice(3, 3)),
        ];

        for (mut ledger, new_slice) in cases {
            let before = total_received(&ledger);
            let overlap: u64 = ledger
                .iter()
                .map(|s| {
                    let lo = s.offset.max(new_slice.offset);
                    let hi = s.end().min(new_slice.end());
                    hi.saturating_sub(lo)
                })
                .sum();
            let index = add_or_merge_received_slice_into_sorted_array(new_slice, &mut ledger);

            assert_well_formed(&ledger);
            assert_eq!(total_received(&ledger), before + new_slice.length - overlap);
            assert_eq!(slice_index_containing(&ledger, new_slice.offset), Some(index));
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut once = vec![slice(0, 10), slice(30, 10)];
        add_or_merge_received_slice_into_sorted_array(slice(15, 5), &mut once);

        let mut twice = once.clone();
        add_or_merge_received_slice_into_sorted_array(slice(15, 5), &mut twice);
        assert_eq!(once, twice);

        add_or_merge_received_slice_into_sorted_array(slice(0, 10), &mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_downloading_every_gap_collapses_ledger() {
        const FILE_SIZE: u64 = 1000;
        let mut ledger = vec![slice(100, 50), slice(400, 100), slice(900, 20)];

        for gap in find_slices_to_download(&ledger) {
            let length = gap.length.unwrap_or(FILE_SIZE - gap.offset);
            add_or_merge_received_slice_into_sorted_array(slice(gap.offset, length), &mut ledger);
        }

        assert_eq!(ledger, vec![slice(0, FILE_SIZE)]);
        assert_eq!(find_slices_to_download(&ledger), vec![SliceToDownload::open(FILE_SIZE)]);
    }

    #[test]
    fn test_zero_length_slice_is_not_recorded() {
        let mut ledger = vec![slice(0, 10)];
        add_or_merge_received_slice_into_sorted_array(slice(50, 0), &mut ledger);
        assert_eq!(ledger, vec![slice(0, 10)]);
    }

    #[test]
    fn test_slice_index_containing() {
        let ledger = vec![slice(0, 10), slice(20, 10)];
        assert_eq!(slice_index_containing(&ledger, 0), Some(0));
        assert_eq!(slice_index_containing(&ledger, 9), Some(0));
        assert_eq!(slice_index_containing(&ledger, 10), None);
        assert_eq!(slice_index_containing(&ledger, 25), Some(1));
        assert_eq!(slice_index_containing(&ledger, 30), None);
    }
}
