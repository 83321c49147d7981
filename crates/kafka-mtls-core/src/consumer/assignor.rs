//! Range partition assignment, computed by the elected group leader.

use std::collections::{BTreeMap, BTreeSet};

/// Assign partitions topic by topic: the sorted members subscribed to a topic
/// each take a contiguous range, and the first `partitions % members` take
/// one extra.
///
/// `members` maps member id to subscribed topics; `partitions` maps topic to
/// its partition ids. Every member appears in the result, possibly with an
/// empty assignment.
#[must_use]
pub fn range_assign(
    members: &BTreeMap<String, Vec<String>>,
    partitions: &BTreeMap<String, Vec<i32>>,
) -> BTreeMap<String, Vec<(String, Vec<i32>)>> {
    let mut result: BTreeMap<String, Vec<(String, Vec<i32>)>> = members
        .keys()
        .map(|member| (member.clone(), Vec::new()))
        .collect();

    let topics: BTreeSet<&String> = members.values().flatten().collect();
    for topic in topics {
        let Some(topic_partitions) = partitions.get(topic) else {
            continue;
        };
        let mut topic_partitions = topic_partitions.clone();
        topic_partitions.sort_unstable();

        let subscribers: Vec<&String> = members
            .iter()
            .filter(|(_, subscribed)| subscribed.contains(topic))
            .map(|(member, _)| member)
            .collect();
        if subscribers.is_empty() {
            continue;
        }

        let per_member = topic_partitions.len() / subscribers.len();
        let extra = topic_partitions.len() % subscribers.len();

        let mut start = 0;
        for (idx, member) in subscribers.into_iter().enumerate() {
            let len = per_member + usize::from(idx < extra);
            let owned = topic_partitions[start..start + len].to_vec();
            start += len;
            if owned.is_empty() {
                continue;
            }
            if let Some(assigned) = result.get_mut(member) {
                assigned.push((topic.clone(), owned));
            }
        }
    }

    result
}
