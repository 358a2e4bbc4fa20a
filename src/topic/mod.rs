//! Topic matching and subscription management
//!
//! Implements topic name/filter validation and a topic trie for efficient
//! subscription matching based on spec/v3.1.1/4.7_topic-names-and-filters.md
//! and spec/v5.0/4.7_topic-names-and-filters.md
//!
//! Performance optimizations:
//! - Uses callback-based matching to avoid intermediate allocations
//! - Uses SmallVec for typical workloads (few matching subscriptions per topic)
//! - Pre-allocates result vectors with reasonable capacity

mod store_backend;
mod trie;
pub mod validation;

pub use store_backend::{
    FjallSubscriptionBackend, RamBackend, RedisSubscriptionBackend, StoreError,
    SubscriptionBackend, StoredSubscription,
};
pub use trie::TopicTrie;
pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_filter_with_max_levels,
    validate_topic_name, validate_topic_name_with_max_levels, TopicLevel,
};

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::protocol::{QoS, RetainHandling};

/// Maximum number of entries in the topic cache
const TOPIC_CACHE_MAX_SIZE: usize = 1024;

/// A subscription entry
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Client ID
    pub client_id: Arc<str>,
    /// Subscription QoS
    pub qos: QoS,
    /// No local flag (v5.0) - don't send messages to the client that published them
    pub no_local: bool,
    /// Retain as published flag (v5.0)
    pub retain_as_published: bool,
    /// Retain handling option (v5.0); governs whether a retained message is sent at subscribe time
    pub retain_handling: RetainHandling,
    /// Subscription identifier (v5.0)
    pub subscription_id: Option<u32>,
    /// Share group name (v5.0) - for shared subscriptions ($share/{group}/{filter})
    pub share_group: Option<Arc<str>>,
}

/// Parse a shared subscription filter
/// Returns (share_group, actual_filter) if it's a shared subscription, or None
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    if let Some(rest) = filter.strip_prefix("$share/") {
        // Format: $share/{group}/{filter}
        // Skip "$share/"
        if let Some(slash_pos) = rest.find('/') {
            let group = &rest[..slash_pos];
            let actual_filter = &rest[slash_pos + 1..];
            if !group.is_empty() && !actual_filter.is_empty() {
                return Some((group, actual_filter));
            }
        }
    }
    None
}

/// Cached topic match result
struct CachedMatch {
    subscriptions: SmallVec<[Subscription; 16]>,
    generation: u64,
}

/// Subscribers attached to a single trie node, keyed for O(1) insert/remove
/// by client rather than a linear scan over every subscriber of the filter.
/// Non-shared subscriptions are keyed directly by client id; shared ones are
/// keyed by group then by client id within the group.
#[derive(Debug, Clone, Default)]
struct NodeSubscribers {
    subs: AHashMap<Arc<str>, Subscription>,
    shares: AHashMap<Arc<str>, AHashMap<Arc<str>, Subscription>>,
}

impl NodeSubscribers {
    fn is_empty(&self) -> bool {
        self.subs.is_empty() && self.shares.is_empty()
    }

    /// Insert/replace a subscription for its client (and share group, if any).
    /// Returns true iff an entry for the same (client, share group) already existed.
    fn insert(&mut self, subscription: Subscription) -> bool {
        match subscription.share_group.clone() {
            Some(group) => self
                .shares
                .entry(group)
                .or_default()
                .insert(subscription.client_id.clone(), subscription)
                .is_some(),
            None => self
                .subs
                .insert(subscription.client_id.clone(), subscription)
                .is_some(),
        }
    }

    /// Remove the subscription for a client (and share group, if any).
    /// Returns true iff an entry was present and removed.
    fn remove(&mut self, client_id: &str, share_group: Option<&str>) -> bool {
        match share_group {
            Some(group) => {
                let Some(members) = self.shares.get_mut(group) else {
                    return false;
                };
                let removed = members.remove(client_id).is_some();
                if members.is_empty() {
                    self.shares.remove(group);
                }
                removed
            }
            None => self.subs.remove(client_id).is_some(),
        }
    }

    /// Remove every entry for a client, across both non-shared and all share groups.
    /// Returns true iff at least one entry was removed.
    fn remove_client(&mut self, client_id: &str) -> bool {
        let mut removed = self.subs.remove(client_id).is_some();
        self.shares.retain(|_, members| {
            if members.remove(client_id).is_some() {
                removed = true;
            }
            !members.is_empty()
        });
        removed
    }

    fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subs
            .values()
            .chain(self.shares.values().flat_map(|members| members.values()))
    }

    fn len(&self) -> usize {
        self.subs.len() + self.shares.values().map(|members| members.len()).sum::<usize>()
    }
}

/// Thread-safe subscription store using topic trie
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<NodeSubscribers>>,
    /// Round-robin counters for shared subscriptions, keyed by share group
    share_counters: DashMap<Arc<str>, AtomicUsize>,
    /// Cache of topic -> matching subscriptions (invalidated on subscription changes)
    topic_cache: DashMap<String, CachedMatch>,
    /// Generation counter - incremented on any subscription change
    generation: AtomicU64,
    /// Backend mirroring subscribe/unsubscribe for crash recovery (ram/disk/redis)
    backend: Arc<dyn SubscriptionBackend>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(RamBackend))
    }

    pub fn with_backend(backend: Arc<dyn SubscriptionBackend>) -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
            share_counters: DashMap::new(),
            topic_cache: DashMap::new(),
            generation: AtomicU64::new(0),
            backend,
        }
    }

    /// Rebuild the trie from whatever the backend persisted across a restart.
    /// Uses default subscription options since QoS/flags aren't part of the
    /// durable key - clients re-issue SUBSCRIBE with their real options on
    /// reconnect, this just restores enough state to route messages meanwhile.
    pub async fn restore_from_backend(&self) -> Result<(), StoreError> {
        for stored in self.backend.load_all().await? {
            let subscription = Subscription {
                client_id: stored.client_id.as_str().into(),
                qos: QoS::AtMostOnce,
                no_local: false,
                retain_as_published: false,
                retain_handling: RetainHandling::SendAtSubscribe,
                subscription_id: None,
                share_group: None,
            };
            self.insert_without_persist(&stored.filter, subscription);
        }
        Ok(())
    }

    fn insert_without_persist(&self, filter: &str, mut subscription: Subscription) {
        let actual_filter = if let Some((group, actual)) = parse_shared_subscription(filter) {
            subscription.share_group = Some(group.into());
            self.share_counters
                .entry(group.into())
                .or_insert_with(|| AtomicUsize::new(0));
            actual
        } else {
            filter
        };

        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(actual_filter) {
            subs.insert(subscription);
        } else {
            let mut subs = NodeSubscribers::default();
            subs.insert(subscription);
            trie.insert(actual_filter, subs);
        }
        drop(trie);
        self.invalidate_cache();
    }

    /// Invalidate cache by incrementing generation
    #[inline]
    fn invalidate_cache(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        // Optionally clear cache if it's too large
        if self.topic_cache.len() > TOPIC_CACHE_MAX_SIZE * 2 {
            self.topic_cache.clear();
        }
    }

    /// Add a subscription. The durable store is written first; if that write
    /// fails the trie is left untouched and the error is returned to the
    /// caller, which reports it on the wire instead of granting the
    /// subscription. Returns `true` if an identical (client, filter[, share
    /// group]) entry was already present — callers use this to suppress
    /// redundant replication events.
    pub async fn subscribe(
        &self,
        filter: &str,
        mut subscription: Subscription,
    ) -> Result<bool, StoreError> {
        self.backend.persist(&subscription.client_id, filter).await?;

        // Check if this is a shared subscription
        let actual_filter = if let Some((group, actual)) = parse_shared_subscription(filter) {
            subscription.share_group = Some(group.into());
            // Ensure we have a counter for this share group
            self.share_counters
                .entry(group.into())
                .or_insert_with(|| AtomicUsize::new(0));
            actual
        } else {
            filter
        };

        let mut trie = self.trie.write();
        let existed = if let Some(subs) = trie.get_mut(actual_filter) {
            subs.insert(subscription)
        } else {
            let mut subs = NodeSubscribers::default();
            let existed = subs.insert(subscription);
            trie.insert(actual_filter, subs);
            existed
        };
        drop(trie);
        self.invalidate_cache();

        Ok(existed)
    }

    /// Remove a subscription. The durable store is written first, same
    /// ordering guarantee as [`Self::subscribe`].
    pub async fn unsubscribe(&self, filter: &str, client_id: &str) -> Result<bool, StoreError> {
        self.backend.remove(client_id, filter).await?;

        // Check if this is a shared subscription
        let (actual_filter, share_group) =
            if let Some((group, actual)) = parse_shared_subscription(filter) {
                (actual, Some(group))
            } else {
                (filter, None)
            };

        let mut trie = self.trie.write();
        let removed = if let Some(subs) = trie.get_mut(actual_filter) {
            let removed = subs.remove(client_id, share_group);
            if subs.is_empty() {
                trie.remove(actual_filter);
            }
            removed
        } else {
            false
        };
        drop(trie);
        if removed {
            self.invalidate_cache();
        }
        Ok(removed)
    }

    /// Remove all subscriptions for a client (e.g. on a clean-start disconnect).
    pub async fn unsubscribe_all(&self, client_id: &str) -> Result<(), StoreError> {
        self.backend.remove_all(client_id).await?;

        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.remove_client(client_id);
            subs.is_empty()
        });
        drop(trie);
        self.invalidate_cache();
        Ok(())
    }

    /// Find all matching subscriptions for a topic
    /// For shared subscriptions, only one subscriber per share group is returned (round-robin)
    ///
    /// Performance: Uses topic cache for frequently-published topics (O(1) lookup)
    /// Cache is invalidated when subscriptions change.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let current_gen = self.generation.load(Ordering::Acquire);

        // Check cache first (only for non-shared subscriptions)
        if let Some(cached) = self.topic_cache.get(topic) {
            if cached.generation == current_gen {
                return cached.subscriptions.clone();
            }
        }

        // Cache miss or stale - compute matches
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        let mut share_groups: AHashMap<Arc<str>, SmallVec<[Subscription; 4]>> =
            AHashMap::with_capacity(4);
        let mut has_shared = false;

        trie.matches(topic, |subs| {
            for sub in subs.iter() {
                if let Some(ref group) = sub.share_group {
                    has_shared = true;
                    share_groups
                        .entry(group.clone())
                        .or_default()
                        .push(sub.clone());
                } else {
                    result.push(sub.clone());
                }
            }
        });
        drop(trie);

        // For each share group, pick one subscriber using round-robin
        for (group, subs) in share_groups {
            if subs.is_empty() {
                continue;
            }
            let counter = self
                .share_counters
                .entry(group)
                .or_insert_with(|| AtomicUsize::new(0));
            let idx = counter.fetch_add(1, Ordering::Relaxed) % subs.len();
            result.push(subs[idx].clone());
        }

        // Cache result only if no shared subscriptions (round-robin makes them uncacheable)
        // and cache isn't too large
        if !has_shared && self.topic_cache.len() < TOPIC_CACHE_MAX_SIZE {
            self.topic_cache.insert(
                topic.to_string(),
                CachedMatch {
                    subscriptions: result.clone(),
                    generation: current_gen,
                },
            );
        }

        result
    }

    /// Find all matching subscriptions using a callback to avoid allocation
    /// For shared subscriptions, only one subscriber per share group is called (round-robin)
    ///
    /// Note: For shared subscriptions, this still needs to clone subscriptions temporarily
    /// to handle the round-robin selection. For non-shared subscriptions, the callback
    /// is invoked immediately without cloning.
    pub fn matches_with_callback<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&Subscription),
    {
        let trie = self.trie.read();
        // Temporary storage for share group selection (must clone due to callback lifetime)
        let mut share_groups: AHashMap<Arc<str>, SmallVec<[Subscription; 4]>> =
            AHashMap::with_capacity(4);

        trie.matches(topic, |subs| {
            for sub in subs.iter() {
                if let Some(ref group) = sub.share_group {
                    // Collect shared subscriptions by group (clone needed for round-robin selection)
                    share_groups
                        .entry(group.clone())
                        .or_default()
                        .push(sub.clone());
                } else {
                    // Non-shared subscriptions get called immediately (no clone!)
                    callback(sub);
                }
            }
        });

        // For each share group, pick one subscriber using round-robin
        for (group, subs) in share_groups {
            if subs.is_empty() {
                continue;
            }
            let counter = self
                .share_counters
                .entry(group)
                .or_insert_with(|| AtomicUsize::new(0));
            let idx = counter.fetch_add(1, Ordering::Relaxed) % subs.len();
            callback(&subs[idx]);
        }
    }

    /// Count the number of shared subscriptions
    /// For $SYS/broker/shared_subscriptions/count
    pub fn shared_subscription_count(&self) -> usize {
        let trie = self.trie.read();
        let mut count = 0;
        trie.for_each(|subs| {
            count += subs.iter().filter(|s| s.share_group.is_some()).count();
        });
        count
    }

    /// Total subscription count across all filters, for $SYS/broker/subscriptions/count
    pub fn subscription_count(&self) -> usize {
        let trie = self.trie.read();
        let mut count = 0;
        trie.for_each(|subs| count += subs.len());
        count
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
