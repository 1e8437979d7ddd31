//! The subscription table and its derived inverse index, kept in
//! lock-step behind one small API (spec §9 design note): `subscriptions`
//! and `subscriptions_by_channel` must never be touched independently.

use std::collections::{HashMap, HashSet};

/// `subscriptionId -> channelId` plus its derived inverse
/// `channelId -> {subscriptionId}`. The only way to mutate either map is
/// through `insert` / `remove` / `remove_all_for_channel`, so the two can
/// never drift out of sync.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionTable {
    by_id: HashMap<u32, u32>,
    by_channel: HashMap<u32, HashSet<u32>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_id(&self, subscription_id: u32) -> bool {
        self.by_id.contains_key(&subscription_id)
    }

    pub fn channel_of(&self, subscription_id: u32) -> Option<u32> {
        self.by_id.get(&subscription_id).copied()
    }

    /// Records a new subscription. Caller must have already checked
    /// `!contains_id` (spec: duplicate subscription ids are rejected
    /// before reaching here).
    pub fn insert(&mut self, subscription_id: u32, channel_id: u32) {
        self.by_id.insert(subscription_id, channel_id);
        self.by_channel
            .entry(channel_id)
            .or_default()
            .insert(subscription_id);
    }

    /// Removes a subscription by id, returning the channel it pointed at
    /// if it existed.
    pub fn remove(&mut self, subscription_id: u32) -> Option<u32> {
        let channel_id = self.by_id.remove(&subscription_id)?;
        if let Some(set) = self.by_channel.get_mut(&channel_id) {
            set.remove(&subscription_id);
            if set.is_empty() {
                self.by_channel.remove(&channel_id);
            }
        }
        Some(channel_id)
    }

    /// Removes every subscription pointing at `channel_id` (used when a
    /// channel is removed from the registry), returning the ids that were
    /// dropped.
    pub fn remove_all_for_channel(&mut self, channel_id: u32) -> Vec<u32> {
        let Some(ids) = self.by_channel.remove(&channel_id) else {
            return Vec::new();
        };
        for id in &ids {
            self.by_id.remove(id);
        }
        ids.into_iter().collect()
    }

    pub fn subscribers_of(&self, channel_id: u32) -> impl Iterator<Item = u32> + '_ {
        self.by_channel
            .get(&channel_id)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    pub fn subscriber_count(&self, channel_id: u32) -> usize {
        self.by_channel.get(&channel_id).map_or(0, HashSet::len)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_id.iter().map(|(&sub, &chan)| (sub, chan))
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_index_stays_consistent_through_insert_and_remove() {
        let mut table = SubscriptionTable::new();
        table.insert(1, 100);
        table.insert(2, 100);
        table.insert(3, 200);
        assert_eq!(table.subscriber_count(100), 2);
        assert_eq!(table.subscriber_count(200), 1);

        table.remove(1);
        assert_eq!(table.subscriber_count(100), 1);
        assert!(table.subscribers_of(100).any(|id| id == 2));

        table.remove(2);
        assert_eq!(table.subscriber_count(100), 0);
    }

    #[test]
    fn remove_all_for_channel_drops_every_subscriber() {
        let mut table = SubscriptionTable::new();
        table.insert(1, 100);
        table.insert(2, 100);
        table.insert(3, 200);
        let mut removed = table.remove_all_for_channel(100);
        removed.sort();
        assert_eq!(removed, vec![1, 2]);
        assert!(!table.contains_id(1));
        assert!(!table.contains_id(2));
        assert!(table.contains_id(3));
    }

    #[test]
    fn recycled_subscription_id_can_be_reused_after_removal() {
        let mut table = SubscriptionTable::new();
        table.insert(1, 100);
        table.remove(1);
        table.insert(1, 200);
        assert_eq!(table.channel_of(1), Some(200));
    }
}
