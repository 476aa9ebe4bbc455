// src/ring.rs

//! Weighted consistent-hash ring with positional member replacement.
//!
//! Members are placed on the ring as `160 × weight` virtual points derived
//! from digests of `"{member}-{i}"`, ketama-style: adding or removing a member
//! remaps only its own share of the key space. `replace` rewrites a member's
//! points in place, so the successor inherits the exact positions, and
//! therefore the exact key ownership, of the member it replaces.

use lru::LruCache;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Virtual points per unit of member weight.
const POINTS_PER_WEIGHT: usize = 160;
/// Each digest contributes this many points (4 bytes of digest per point).
const POINTS_PER_DIGEST: usize = 4;
/// Capacity of the cached-lookup table.
const LOOKUP_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(4096).unwrap();

pub struct HashRing {
    /// Sorted `(hash point, member)` pairs.
    points: Vec<(u32, Arc<str>)>,
    weights: HashMap<Arc<str>, u32>,
    /// Key → member cache for `get_cached`; cleared on any membership change.
    cache: Mutex<LruCache<Vec<u8>, Arc<str>>>,
}

impl HashRing {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            weights: HashMap::new(),
            cache: Mutex::new(LruCache::new(LOOKUP_CACHE_CAPACITY)),
        }
    }

    /// Registers a member with the given weight. Re-adding an existing member
    /// replaces its previous registration.
    pub fn add(&mut self, member: &str, weight: u32) {
        if self.weights.contains_key(member) {
            self.remove(member);
        }
        let member: Arc<str> = Arc::from(member);
        let weight = weight.max(1);
        let digests = (POINTS_PER_WEIGHT * weight as usize) / POINTS_PER_DIGEST;
        for i in 0..digests {
            let digest = Sha1::digest(format!("{member}-{i}").as_bytes());
            for chunk in 0..POINTS_PER_DIGEST {
                let off = chunk * 4;
                let point = u32::from_le_bytes([
                    digest[off],
                    digest[off + 1],
                    digest[off + 2],
                    digest[off + 3],
                ]);
                self.points.push((point, member.clone()));
            }
        }
        self.points
            .sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        self.weights.insert(member, weight);
        self.cache.lock().clear();
    }

    /// Drops a member and its points; its key space redistributes across the
    /// remaining members.
    pub fn remove(&mut self, member: &str) {
        self.points.retain(|(_, m)| m.as_ref() != member);
        self.weights.remove(member);
        self.cache.lock().clear();
    }

    /// Rewrites `old`'s points to `new` in place. `new` inherits `old`'s
    /// exact ring positions; `weight` is recorded for the new member.
    pub fn replace(&mut self, old: &str, new: &str, weight: u32) {
        let new_member: Arc<str> = Arc::from(new);
        for point in &mut self.points {
            if point.1.as_ref() == old {
                point.1 = new_member.clone();
            }
        }
        self.weights.remove(old);
        self.weights.insert(new_member, weight.max(1));
        self.cache.lock().clear();
    }

    /// Resolves the member owning `key`, or `None` on an empty ring.
    pub fn get(&self, key: &[u8]) -> Option<Arc<str>> {
        if self.points.is_empty() {
            return None;
        }
        let hash = key_hash(key);
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(self.points[idx].1.clone())
    }

    /// Cached variant of [`get`](Self::get) for the routing fast path.
    pub fn get_cached(&self, key: &[u8]) -> Option<Arc<str>> {
        let mut cache = self.cache.lock();
        if let Some(member) = cache.get(key) {
            return Some(member.clone());
        }
        let member = self.get(key)?;
        cache.put(key.to_vec(), member.clone());
        Some(member)
    }

    pub fn contains(&self, member: &str) -> bool {
        self.weights.contains_key(member)
    }

    pub fn member_count(&self) -> usize {
        self.weights.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

fn key_hash(key: &[u8]) -> u32 {
    let digest = Sha1::digest(key);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(members: &[&str]) -> HashRing {
        let mut ring = HashRing::new();
        for member in members {
            ring.add(member, 1);
        }
        ring
    }

    #[test]
    fn empty_ring_resolves_nothing() {
        assert!(HashRing::new().get(b"key").is_none());
        assert!(HashRing::new().get_cached(b"key").is_none());
    }

    #[test]
    fn single_member_owns_everything() {
        let ring = ring(&["a:11211"]);
        for key in [&b"x"[..], b"", b"another-key"] {
            assert_eq!(ring.get(key).unwrap().as_ref(), "a:11211");
        }
    }

    #[test]
    fn routing_is_deterministic() {
        let ring = ring(&["a:11211", "b:11211", "c:11211"]);
        for i in 0..64 {
            let key = format!("key-{i}");
            assert_eq!(ring.get(key.as_bytes()), ring.get(key.as_bytes()));
            assert_eq!(ring.get(key.as_bytes()), ring.get_cached(key.as_bytes()));
        }
    }

    #[test]
    fn weight_scales_point_count() {
        let mut ring = HashRing::new();
        ring.add("a:11211", 1);
        ring.add("b:11211", 3);
        assert_eq!(ring.point_count(), 160 + 480);
        assert_eq!(ring.member_count(), 2);
    }

    #[test]
    fn distribution_is_roughly_uniform() {
        let ring = ring(&["a:11211", "b:11211", "c:11211"]);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for i in 0..10_000u32 {
            let key = format!("key-{i}");
            let member = ring.get(key.as_bytes()).unwrap();
            *counts.entry(member.to_string()).or_default() += 1;
        }
        for (member, count) in &counts {
            assert!(
                (2000..=4800).contains(count),
                "member {member} got {count} of 10000 keys: {counts:?}"
            );
        }
    }

    #[test]
    fn removal_remaps_only_the_removed_share() {
        let full = ring(&["a:11211", "b:11211", "c:11211", "d:11211"]);
        let mut reduced = ring(&["a:11211", "b:11211", "c:11211", "d:11211"]);
        reduced.remove("d:11211");

        let mut remapped = 0u32;
        let total = 10_000u32;
        for i in 0..total {
            let key = format!("key-{i}");
            let before = full.get(key.as_bytes()).unwrap();
            let after = reduced.get(key.as_bytes()).unwrap();
            if before.as_ref() == "d:11211" {
                assert_ne!(after.as_ref(), "d:11211");
            } else if before != after {
                remapped += 1;
            }
        }
        // Keys not owned by the removed member must not move at all.
        assert_eq!(remapped, 0);
    }

    #[test]
    fn replace_inherits_exact_ownership() {
        let original = ring(&["a:11211", "b:11211", "c:11211"]);
        let mut replaced = ring(&["a:11211", "b:11211", "c:11211"]);
        replaced.replace("b:11211", "standby:11211", 1);

        assert!(!replaced.contains("b:11211"));
        assert!(replaced.contains("standby:11211"));
        for i in 0..2_000u32 {
            let key = format!("key-{i}");
            let before = original.get(key.as_bytes()).unwrap();
            let after = replaced.get(key.as_bytes()).unwrap();
            if before.as_ref() == "b:11211" {
                assert_eq!(after.as_ref(), "standby:11211");
            } else {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn cached_lookup_is_invalidated_on_membership_change() {
        let mut ring = ring(&["a:11211", "b:11211"]);
        let key = b"stable-key";
        let before = ring.get_cached(key).unwrap();
        ring.remove(before.as_ref());
        let after = ring.get_cached(key).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn re_adding_a_member_does_not_duplicate_points() {
        let mut ring = HashRing::new();
        ring.add("a:11211", 1);
        ring.add("a:11211", 2);
        assert_eq!(ring.point_count(), 320);
        assert_eq!(ring.member_count(), 1);
    }
}
