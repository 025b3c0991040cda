//! Batch planning: deterministic greedy bin-packing of content items into
//! capacity-bounded batches.
//!
//! Items are atomic: a post's media travels together in one batch unless the
//! post alone exceeds the capacity, in which case only its first `capacity`
//! units are taken and the rest wait for a later planning run. Pure function
//! over immutable inputs; no I/O, no hidden state.

/// One content item as seen by the planner: its id and the media units still
/// undelivered to the target chat, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedItem {
    pub item_id: i64,
    pub media: Vec<i64>,
}

/// One delivery call's worth of media unit ids, in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub media: Vec<i64>,
}

/// First-fit-decreasing with restart scan.
///
/// Each batch greedily pulls the largest unassigned item that fits its
/// remaining capacity, restarting the scan after every assignment to keep
/// the packing tight. Ties keep the caller's (newest-first) order, so the
/// result is deterministic. When the smallest remaining item alone exceeds
/// capacity, it is force-assigned truncated to `capacity` — the only case
/// where an item's media is split across a batch boundary.
pub fn plan_batches(items: &[PlannedItem], capacity: usize) -> Vec<PlannedBatch> {
    assert!(capacity > 0, "batch capacity must be positive");

    // Indices sorted largest-first; stable sort preserves recency order on ties.
    let mut order: Vec<usize> = (0..items.len())
        .filter(|&i| !items[i].media.is_empty())
        .collect();
    order.sort_by(|&a, &b| items[b].media.len().cmp(&items[a].media.len()));

    let mut used = vec![false; items.len()];
    let mut remaining = order.len();
    let mut batches = Vec::new();

    while remaining > 0 {
        let mut media: Vec<i64> = Vec::new();
        let mut capacity_left = capacity;

        let mut added = true;
        while added && capacity_left > 0 {
            added = false;
            for &idx in &order {
                if used[idx] {
                    continue;
                }
                if items[idx].media.len() <= capacity_left {
                    media.extend_from_slice(&items[idx].media);
                    capacity_left -= items[idx].media.len();
                    used[idx] = true;
                    remaining -= 1;
                    added = true;
                    break; // restart the scan from the largest item
                }
            }
        }

        // Nothing fit an empty batch: the smallest remaining item is larger
        // than the capacity. Take its first `capacity` units; the remainder
        // is left for a later planning run.
        if media.is_empty() {
            if let Some(&idx) = order.iter().rev().find(|&&i| !used[i]) {
                media.extend_from_slice(&items[idx].media[..capacity]);
                used[idx] = true;
                remaining -= 1;
            }
        }

        if !media.is_empty() {
            batches.push(PlannedBatch { media });
        }
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(item_id: i64, media: std::ops::Range<i64>) -> PlannedItem {
        PlannedItem {
            item_id,
            media: media.collect(),
        }
    }

    #[test]
    fn packs_two_full_and_one_remainder_batch() {
        // Undelivered counts [10, 10, 1, 1, 1] at capacity 10.
        let items = vec![
            item(0, 0..10),
            item(1, 10..20),
            item(2, 20..21),
            item(3, 21..22),
            item(4, 22..23),
        ];

        let batches = plan_batches(&items, 10);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].media, (0..10).collect::<Vec<_>>());
        assert_eq!(batches[1].media, (10..20).collect::<Vec<_>>());
        assert_eq!(batches[2].media, vec![20, 21, 22]);
    }

    #[test]
    fn oversized_item_is_truncated_to_capacity() {
        let items = vec![item(0, 0..14)];

        let batches = plan_batches(&items, 10);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].media, (0..10).collect::<Vec<_>>());
        // Units 10..14 are left for a subsequent planning run.
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let items = vec![
            item(0, 0..7),
            item(1, 10..13),
            item(2, 20..26),
            item(3, 30..34),
            item(4, 40..42),
        ];

        let batches = plan_batches(&items, 10);

        for batch in &batches {
            assert!(batch.media.len() <= 10);
        }
    }

    #[test]
    fn every_unit_is_covered_exactly_once() {
        let items = vec![
            item(0, 0..3),
            item(1, 10..15),
            item(2, 20..28),
            item(3, 30..31),
            item(4, 40..49),
        ];

        let batches = plan_batches(&items, 10);

        let mut seen: Vec<i64> = batches.iter().flat_map(|b| b.media.clone()).collect();
        seen.sort();
        let mut expected: Vec<i64> = items.iter().flat_map(|i| i.media.clone()).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn items_within_capacity_are_never_split() {
        let items = vec![
            item(0, 0..6),
            item(1, 10..16),
            item(2, 20..26),
        ];

        let batches = plan_batches(&items, 10);

        for it in &items {
            let holding: Vec<_> = batches
                .iter()
                .filter(|b| b.media.iter().any(|m| it.media.contains(m)))
                .collect();
            assert_eq!(holding.len(), 1, "item {} split across batches", it.item_id);
            // And the batch holds all of it.
            assert!(it.media.iter().all(|m| holding[0].media.contains(m)));
        }
    }

    #[test]
    fn ties_keep_recency_order() {
        let items = vec![
            item(0, 0..4),
            item(1, 10..14),
            item(2, 20..24),
        ];

        let batches = plan_batches(&items, 10);

        // First batch packs the two newest equal-sized items.
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].media[..4], [0, 1, 2, 3]);
        assert_eq!(batches[0].media[4..], [10, 11, 12, 13]);
        assert_eq!(batches[1].media, vec![20, 21, 22, 23]);
    }

    #[test]
    fn empty_input_plans_nothing() {
        assert!(plan_batches(&[], 10).is_empty());
        let only_empty = vec![PlannedItem {
            item_id: 1,
            media: vec![],
        }];
        assert!(plan_batches(&only_empty, 10).is_empty());
    }

    #[test]
    fn mixed_oversized_and_small_items() {
        let items = vec![item(0, 0..12), item(1, 20..23)];

        let batches = plan_batches(&items, 10);

        // Small item fills the first batch it fits; oversized is truncated.
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].media, vec![20, 21, 22]);
        assert_eq!(batches[1].media, (0..10).collect::<Vec<_>>());
    }
}
