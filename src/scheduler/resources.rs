//! Per-resource-key slot accounting.
//!
//! A step holding resource keys occupies one slot per key from dispatch
//! until its terminal event. Acquisition is all-or-nothing so a step
//! never deadlocks holding half its keys. Keys without a configured
//! limit are unlimited.

use rustc_hash::FxHashMap;

#[derive(Debug, Default)]
pub struct ResourcePools {
    limits: FxHashMap<String, usize>,
    in_use: FxHashMap<String, usize>,
}

impl ResourcePools {
    #[must_use]
    pub fn new(limits: &FxHashMap<String, usize>) -> Self {
        ResourcePools {
            limits: limits.clone(),
            in_use: FxHashMap::default(),
        }
    }

    /// Take one slot of every key, or none at all. A key listed more
    /// than once still occupies a single slot.
    pub fn try_acquire(&mut self, keys: &[String]) -> bool {
        let fits = keys.iter().all(|key| match self.limits.get(key) {
            Some(limit) => self.in_use.get(key).copied().unwrap_or(0) < *limit,
            None => true,
        });
        if !fits {
            return false;
        }
        for (i, key) in keys.iter().enumerate() {
            if keys[..i].contains(key) {
                continue;
            }
            *self.in_use.entry(key.clone()).or_insert(0) += 1;
        }
        true
    }

    /// The first key configured with a zero limit, if any. Such a key
    /// can never grant a slot.
    #[must_use]
    pub fn dead_key<'a>(&self, keys: &'a [String]) -> Option<&'a str> {
        keys.iter()
            .find(|key| self.limits.get(key.as_str()) == Some(&0))
            .map(String::as_str)
    }

    pub fn release(&mut self, keys: &[String]) {
        for (i, key) in keys.iter().enumerate() {
            if keys[..i].contains(key) {
                continue;
            }
            if let Some(count) = self.in_use.get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }
    }

    #[cfg(test)]
    fn used(&self, key: &str) -> usize {
        self.in_use.get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools(limits: &[(&str, usize)]) -> ResourcePools {
        let limits = limits
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        ResourcePools::new(&limits)
    }

    #[test]
    fn acquisition_is_all_or_nothing() {
        let mut pools = pools(&[("gpu", 1), ("db", 2)]);
        assert!(pools.try_acquire(&["gpu".into(), "db".into()]));
        // gpu is exhausted, so db must not be touched either.
        assert!(!pools.try_acquire(&["gpu".into(), "db".into()]));
        assert_eq!(pools.used("db"), 1);
    }

    #[test]
    fn release_frees_slots() {
        let mut pools = pools(&[("gpu", 1)]);
        let keys = vec!["gpu".to_string()];
        assert!(pools.try_acquire(&keys));
        assert!(!pools.try_acquire(&keys));
        pools.release(&keys);
        assert!(pools.try_acquire(&keys));
    }

    #[test]
    fn zero_limit_keys_are_reported_dead() {
        let pools = pools(&[("gpu", 0), ("db", 2)]);
        assert_eq!(pools.dead_key(&["db".into(), "gpu".into()]), Some("gpu"));
        assert_eq!(pools.dead_key(&["db".into()]), None);
        assert_eq!(pools.dead_key(&[]), None);
    }

    #[test]
    fn duplicate_keys_occupy_one_slot() {
        let mut pools = pools(&[("db", 1)]);
        let keys = vec!["db".to_string(), "db".to_string()];
        assert!(pools.try_acquire(&keys));
        assert_eq!(pools.used("db"), 1);
        pools.release(&keys);
        assert_eq!(pools.used("db"), 0);
    }

    #[test]
    fn unconfigured_keys_are_unlimited() {
        let mut pools = pools(&[]);
        for _ in 0..100 {
            assert!(pools.try_acquire(&["anything".into()]));
        }
    }
}
