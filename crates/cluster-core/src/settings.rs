//! Settings
//!
//! `Settings` is a flat, ordered key/value map (`cluster.routing.allocation.exclude.rack`
//! style keys). `ClusterSettings` holds the live effective snapshot and
//! notifies components that registered interest in a key prefix whenever
//! an update touches it.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("Failed to parse value [{value}] for setting [{key}]: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Immutable flat settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    map: BTreeMap<String, String>,
}

impl Settings {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Parse a setting, falling back to `default` when absent
    pub fn get_as<T>(&self, key: &str, default: T) -> Result<T, SettingsError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.map.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| SettingsError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// All settings under `prefix`, with the prefix stripped from the keys
    pub fn by_prefix(&self, prefix: &str) -> Settings {
        self.map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect()
    }

    /// A copy of these settings overlaid with `other` (other wins)
    pub fn merged_with(&self, other: &Settings) -> Settings {
        let mut map = self.map.clone();
        map.extend(other.map.iter().map(|(k, v)| (k.clone(), v.clone())));
        Settings { map }
    }

    /// Keys whose value differs between the two snapshots (including
    /// keys present in only one of them)
    pub fn changed_keys(&self, other: &Settings) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (k, v) in &self.map {
            if other.map.get(k) != Some(v) {
                changed.insert(k.clone());
            }
        }
        for k in other.map.keys() {
            if !self.map.contains_key(k) {
                changed.insert(k.clone());
            }
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Settings builder
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    map: BTreeMap<String, String>,
}

impl SettingsBuilder {
    pub fn put(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.map.insert(key.into(), value.to_string());
        self
    }

    pub fn put_all(mut self, settings: &Settings) -> Self {
        self.map
            .extend(settings.map.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.map.remove(key);
        self
    }

    pub fn build(self) -> Settings {
        Settings { map: self.map }
    }
}

type UpdateConsumer = Box<dyn Fn(&Settings) + Send + Sync>;

struct RegisteredConsumer {
    prefixes: Vec<String>,
    consumer: UpdateConsumer,
}

impl RegisteredConsumer {
    fn interested_in(&self, changed: &BTreeSet<String>) -> bool {
        changed
            .iter()
            .any(|key| self.prefixes.iter().any(|p| key.starts_with(p.as_str())))
    }
}

/// Live cluster settings with update notification
pub struct ClusterSettings {
    current: RwLock<Arc<Settings>>,
    consumers: RwLock<Vec<RegisteredConsumer>>,
    /// Serializes concurrent updates so consumers observe them in order
    apply_lock: Mutex<()>,
}

impl ClusterSettings {
    pub fn new(initial: Settings) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            consumers: RwLock::new(Vec::new()),
            apply_lock: Mutex::new(()),
        }
    }

    /// Current effective settings snapshot
    pub fn current(&self) -> Arc<Settings> {
        self.current.read().clone()
    }

    /// Register a callback invoked with the full new snapshot whenever a
    /// key starting with one of `prefixes` changes
    pub fn add_settings_update_consumer<F>(&self, prefixes: &[&str], consumer: F)
    where
        F: Fn(&Settings) + Send + Sync + 'static,
    {
        self.consumers.write().push(RegisteredConsumer {
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            consumer: Box::new(consumer),
        });
    }

    /// Install a new snapshot and notify interested consumers.
    ///
    /// Returns the number of consumers notified.
    pub fn apply_settings(&self, new_settings: Settings) -> usize {
        let _guard = self.apply_lock.lock();
        let previous = self.current();
        let changed = previous.changed_keys(&new_settings);
        if changed.is_empty() {
            return 0;
        }

        let snapshot = Arc::new(new_settings);
        *self.current.write() = snapshot.clone();

        let consumers = self.consumers.read();
        let mut notified = 0;
        for registered in consumers.iter() {
            if registered.interested_in(&changed) {
                (registered.consumer)(&snapshot);
                notified += 1;
            }
        }
        debug!(
            "Applied cluster settings: {} keys changed, {} consumers notified",
            changed.len(),
            notified
        );
        notified
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self::new(Settings::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_by_prefix_strips_prefix() {
        let settings = Settings::builder()
            .put("cluster.routing.allocation.exclude.rack", "r1")
            .put("cluster.routing.allocation.exclude._name", "n1,n2")
            .put("cluster.routing.allocation.include.zone", "z1")
            .build();

        let exclude = settings.by_prefix("cluster.routing.allocation.exclude.");
        assert_eq!(exclude.len(), 2);
        assert_eq!(exclude.get("rack"), Some("r1"));
        assert_eq!(exclude.get("_name"), Some("n1,n2"));
    }

    #[test]
    fn test_get_as() {
        let settings = Settings::builder().put("a", "3").put("b", "x").build();
        assert_eq!(settings.get_as("a", 1u32), Ok(3));
        assert_eq!(settings.get_as("missing", 1u32), Ok(1));
        assert!(settings.get_as("b", 1u32).is_err());
    }

    #[test]
    fn test_changed_keys() {
        let a = Settings::builder().put("x", "1").put("y", "2").build();
        let b = Settings::builder().put("x", "1").put("y", "3").put("z", "4").build();
        let changed: Vec<_> = a.changed_keys(&b).into_iter().collect();
        assert_eq!(changed, vec!["y".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_consumers_only_see_relevant_updates() {
        let cluster_settings = ClusterSettings::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        cluster_settings.add_settings_update_consumer(
            &["cluster.routing.allocation.exclude."],
            move |s| {
                assert_eq!(s.get("cluster.routing.allocation.exclude.rack"), Some("r1"));
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        let unrelated = Settings::builder().put("cluster.name", "test").build();
        assert_eq!(cluster_settings.apply_settings(unrelated.clone()), 0);

        let related = Settings::builder()
            .put_all(&unrelated)
            .put("cluster.routing.allocation.exclude.rack", "r1")
            .build();
        assert_eq!(cluster_settings.apply_settings(related.clone()), 1);
        // Same snapshot again: nothing changed
        assert_eq!(cluster_settings.apply_settings(related), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
