//! Capacity bound shared by the store's keyed maps.
//!
//! When a map is full and a new key arrives, the least recently active entry
//! that is not protected by a running flow is evicted first.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::{ChannelContext, Conversation, UserContext};

pub(crate) trait Recency {
    fn last_active(&self) -> DateTime<Utc>;
}

impl Recency for Conversation {
    fn last_active(&self) -> DateTime<Utc> {
        self.last_activity
    }
}

impl Recency for ChannelContext {
    fn last_active(&self) -> DateTime<Utc> {
        self.last_activity
    }
}

impl Recency for UserContext {
    fn last_active(&self) -> DateTime<Utc> {
        self.last_seen
    }
}

/// Evict one entry if inserting `key` would push `map` past `max_entries`.
///
/// Returns the evicted key. No reference into `map` may be held by the caller.
pub(crate) fn make_room<V, P>(
    map: &DashMap<String, V>,
    key: &str,
    max_entries: usize,
    is_protected: P,
) -> Option<String>
where
    V: Recency,
    P: Fn(&str) -> bool,
{
    if max_entries == 0 || map.contains_key(key) || map.len() < max_entries {
        return None;
    }

    let victim = map
        .iter()
        .filter(|e| !is_protected(e.key()))
        .min_by(|a, b| {
            a.value()
                .last_active()
                .cmp(&b.value().last_active())
                .then_with(|| a.key().cmp(b.key()))
        })
        .map(|e| e.key().clone())?;

    map.remove(&victim).map(|(k, _)| k)
}
