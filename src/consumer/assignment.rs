//! Range assignment of topic partitions to group members.

use std::collections::BTreeMap;

use crate::broker::TopicPartition;

/// Index of a member within the group.
pub type MemberId = usize;

/// Partition ownership for one generation of the group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    members: usize,
    owners: BTreeMap<TopicPartition, MemberId>,
}

/// Ownership change of one partition between two assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMove {
    pub topic_partition: TopicPartition,
    pub from: Option<MemberId>,
    pub to: Option<MemberId>,
}

impl Assignment {
    /// Split each topic's partitions into contiguous ranges, one per member.
    ///
    /// The first `partitions % members` members get one extra partition.
    pub fn range(topics: &[String], partitions: u32, members: usize) -> Self {
        let mut owners = BTreeMap::new();
        if members == 0 {
            return Self { members, owners };
        }

        let per_member = partitions as usize / members;
        let extra = partitions as usize % members;

        for topic in topics {
            let mut next = 0u32;
            for member in 0..members {
                let count = per_member + usize::from(member < extra);
                for _ in 0..count {
                    owners.insert(TopicPartition::new(topic.clone(), next), member);
                    next += 1;
                }
            }
        }

        Self { members, owners }
    }

    pub fn members(&self) -> usize {
        self.members
    }

    pub fn owner(&self, tp: &TopicPartition) -> Option<MemberId> {
        self.owners.get(tp).copied()
    }

    pub fn partitions_of(&self, member: MemberId) -> Vec<TopicPartition> {
        self.owners
            .iter()
            .filter(|(_, owner)| **owner == member)
            .map(|(tp, _)| tp.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Partitions whose owner differs in `next`, in partition order.
    pub fn moves_to(&self, next: &Assignment) -> Vec<PartitionMove> {
        let mut moves: Vec<PartitionMove> = self
            .owners
            .iter()
            .filter_map(|(tp, from)| {
                let to = next.owner(tp);
                (to != Some(*from)).then(|| PartitionMove {
                    topic_partition: tp.clone(),
                    from: Some(*from),
                    to,
                })
            })
            .collect();

        moves.extend(
            next.owners
                .iter()
                .filter(|(tp, _)| !self.owners.contains_key(*tp))
                .map(|(tp, to)| PartitionMove {
                    topic_partition: tp.clone(),
                    from: None,
                    to: Some(*to),
                }),
        );
        moves.sort_by(|a, b| a.topic_partition.cmp(&b.topic_partition));
        moves
    }
}
