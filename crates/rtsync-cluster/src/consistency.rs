//! Split-brain arbitration.
//!
//! Every surviving node runs [`find_condemned`] on the same set of ID cards
//! and must reach the same verdict without talking to the others: a node
//! belonging to the condemned set shuts itself down.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::idcard::IdCard;

/// Nodes that must leave the cluster to resolve a partition, if any.
///
/// Each card's topology plus its own id is the partition that node believes
/// in; a partition smaller than the whole cluster is a split. The smallest
/// splits are candidates. A single candidate is condemned. Otherwise nodes
/// appearing in a single split are "isolated", and the youngest of them
/// (latest birthdate, then greatest id) designates the candidate whose
/// isolated members are condemned. Without isolated nodes, only the youngest
/// member of the candidates is condemned.
pub fn find_condemned(cards: &[IdCard]) -> Option<BTreeSet<String>> {
    let splits = detect_splits(cards);
    if splits.is_empty() {
        return None;
    }

    let existing: BTreeSet<&str> = cards.iter().map(|card| card.id.as_str()).collect();
    let mut splits: Vec<BTreeSet<String>> = splits
        .into_iter()
        .map(|split| {
            split
                .into_iter()
                .filter(|id| existing.contains(id.as_str()))
                .collect::<BTreeSet<String>>()
        })
        .filter(|split| !split.is_empty())
        .collect();
    if splits.is_empty() {
        return None;
    }
    splits.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    let smallest = splits[0].len();
    let eligible: Vec<&BTreeSet<String>> =
        splits.iter().filter(|split| split.len() == smallest).collect();
    if eligible.len() == 1 {
        return Some(eligible[0].clone());
    }

    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    for split in &splits {
        for id in split {
            *occurrences.entry(id.as_str()).or_default() += 1;
        }
    }
    let candidates: BTreeSet<&str> = eligible
        .iter()
        .flat_map(|split| split.iter().map(String::as_str))
        .collect();
    let isolated: BTreeSet<&str> = candidates
        .iter()
        .copied()
        .filter(|id| occurrences.get(id) == Some(&1))
        .collect();

    let birthdates: BTreeMap<&str, i64> = cards
        .iter()
        .map(|card| (card.id.as_str(), card.birthdate))
        .collect();
    let pool = if isolated.is_empty() { &candidates } else { &isolated };
    let youngest = youngest(pool, &birthdates)?;

    if isolated.is_empty() {
        return Some(BTreeSet::from([youngest.to_string()]));
    }
    let split = eligible.iter().find(|split| split.contains(youngest))?;
    Some(
        split
            .iter()
            .filter(|id| isolated.contains(id.as_str()))
            .cloned()
            .collect(),
    )
}

/// Distinct partitions, as seen by each card, that do not cover every card.
fn detect_splits(cards: &[IdCard]) -> BTreeSet<BTreeSet<String>> {
    let mut splits = BTreeSet::new();
    for card in cards {
        let mut partition = card.topology.clone();
        partition.insert(card.id.clone());
        if partition.len() != cards.len() {
            splits.insert(partition);
        }
    }
    splits
}

fn youngest<'a>(pool: &BTreeSet<&'a str>, birthdates: &BTreeMap<&str, i64>) -> Option<&'a str> {
    pool.iter().copied().max_by(|a, b| {
        let born_a = birthdates.get(a).copied().unwrap_or(i64::MIN);
        let born_b = birthdates.get(b).copied().unwrap_or(i64::MIN);
        match born_a.cmp(&born_b) {
            Ordering::Equal => a.cmp(b),
            other => other,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn card(id: &str, birthdate: i64, topology: &[&str]) -> IdCard {
        IdCard {
            id: id.to_string(),
            ip: format!("ip-{}", id),
            birthdate,
            topology: topology.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_full_mesh_is_consistent() {
        let cards = vec![
            card("a", 1, &["b", "c"]),
            card("b", 2, &["a", "c"]),
            card("c", 3, &["a", "b"]),
        ];
        assert_eq!(find_condemned(&cards), None);
    }

    #[test]
    fn test_isolated_node_is_condemned_from_every_view() {
        let cards = vec![card("a", 1, &["b"]), card("b", 2, &["a"]), card("c", 3, &[])];
        for rotation in 0..cards.len() {
            let mut view = cards.clone();
            view.rotate_left(rotation);
            assert_eq!(find_condemned(&view), Some(set(&["c"])));
        }
    }

    #[test]
    fn test_even_split_condemns_youngest_isolated_side() {
        let cards = vec![card("a", 10, &[]), card("b", 20, &[])];
        assert_eq!(find_condemned(&cards), Some(set(&["b"])));
    }

    #[test]
    fn test_birthdate_tie_goes_to_greatest_id() {
        let cards = vec![card("a", 10, &[]), card("b", 10, &[])];
        assert_eq!(find_condemned(&cards), Some(set(&["b"])));
    }

    #[test]
    fn test_three_equal_splits() {
        let cards = vec![
            card("a", 1, &["b"]),
            card("b", 2, &["a"]),
            card("c", 3, &["d"]),
            card("d", 4, &["c"]),
            card("e", 6, &["f"]),
            card("f", 5, &["e"]),
        ];
        assert_eq!(find_condemned(&cards), Some(set(&["e", "f"])));
    }

    #[test]
    fn test_shared_member_is_spared() {
        let cards = vec![
            card("a", 1, &["b", "c"]),
            card("b", 5, &["a"]),
            card("c", 3, &["a"]),
        ];
        assert_eq!(find_condemned(&cards), Some(set(&["b"])));
    }

    #[test]
    fn test_no_isolated_node_condemns_youngest_member() {
        let cards = vec![card("a", 1, &["b"]), card("b", 2, &["c"]), card("c", 3, &["a"])];
        assert_eq!(find_condemned(&cards), Some(set(&["c"])));
    }

    #[test]
    fn test_single_smallest_split_is_condemned() {
        let cards = vec![
            card("a", 9, &["b"]),
            card("b", 1, &["a"]),
            card("c", 2, &["a", "b"]),
            card("d", 3, &["a", "b"]),
            card("x", 4, &["a", "b", "c"]),
        ];
        assert_eq!(find_condemned(&cards), Some(set(&["a", "b"])));
    }

    #[test]
    fn test_expired_nodes_are_ignored() {
        let cards = vec![
            card("a", 1, &["gone"]),
            card("b", 2, &["a", "c"]),
            card("c", 3, &["a", "b"]),
        ];
        assert_eq!(find_condemned(&cards), Some(set(&["a"])));
    }

    fn cards_strategy() -> impl Strategy<Value = Vec<IdCard>> {
        (3usize..7).prop_flat_map(|n| {
            (
                prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
                prop::collection::vec(0i64..4, n),
            )
                .prop_map(move |(links, births)| {
                    (0..n)
                        .map(|i| IdCard {
                            id: format!("node-{}", i),
                            ip: format!("10.0.0.{}", i),
                            birthdate: births[i],
                            topology: (0..n)
                                .filter(|&j| j != i && links[i][j])
                                .map(|j| format!("node-{}", j))
                                .collect(),
                        })
                        .collect()
                })
        })
    }

    proptest! {
        #[test]
        fn prop_verdict_is_independent_of_the_view(cards in cards_strategy(), rotation in 0usize..7) {
            let reference = find_condemned(&cards);
            let mut view = cards.clone();
            view.rotate_left(rotation % cards.len());
            view.swap(0, 1);
            prop_assert_eq!(find_condemned(&view), reference.clone());

            if let Some(condemned) = reference {
                prop_assert!(!condemned.is_empty());
                prop_assert!(condemned.len() < cards.len());
            }
        }
    }
}
