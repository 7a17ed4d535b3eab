//! Topic resolution cache
//!
//! Maps an inbound topic string to the phase field it feeds. Each distinct
//! topic is matched against the configured suffix bindings once; the outcome,
//! including "no binding", is memoized for the life of the process.

use crate::phase::{Field, PhaseLine};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Resolved target of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub phase: usize,
    pub field: Field,
}

#[derive(Debug, Clone)]
struct TopicBinding {
    suffix: String,
    target: Binding,
}

pub struct TopicResolver {
    bindings: Vec<TopicBinding>,
    cache: DashMap<String, Option<Binding>>,
    scans: AtomicUsize,
}

impl TopicResolver {
    /// Captures the bindings of `phases` in scan order: ascending phase, then
    /// voltage, current, power, imported, exported.
    pub fn new(phases: &[PhaseLine]) -> Self {
        let bindings = phases
            .iter()
            .enumerate()
            .flat_map(|(phase, line)| {
                line.topics.iter().map(move |(field, suffix)| TopicBinding {
                    suffix: suffix.to_string(),
                    target: Binding { phase, field },
                })
            })
            .collect();

        Self {
            bindings,
            cache: DashMap::new(),
            scans: AtomicUsize::new(0),
        }
    }

    pub fn resolve(&self, topic: &str) -> Option<Binding> {
        if let Some(cached) = self.cache.get(topic) {
            return *cached;
        }

        // The entry guard holds the shard write lock, so concurrent first
        // sightings of the same topic scan once and all see the stored result.
        *self
            .cache
            .entry(topic.to_string())
            .or_insert_with(|| self.scan(topic))
    }

    fn scan(&self, topic: &str) -> Option<Binding> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let found = self
            .bindings
            .iter()
            .find(|binding| topic.ends_with(&binding.suffix))
            .map(|binding| binding.target);

        match found {
            Some(target) => trace!(topic, phase = target.phase, field = %target.field, "cached topic binding"),
            None => trace!(topic, "no binding for topic, caching miss"),
        }
        found
    }

    /// Number of full scans performed so far.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }

    pub fn cached_topics(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::TopicBindings;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn phases() -> Vec<PhaseLine> {
        ["L1", "L2", "L3"]
            .iter()
            .map(|name| {
                PhaseLine::new(
                    *name,
                    TopicBindings {
                        voltage: format!("{name}/Voltage"),
                        power: format!("{name}/Power"),
                        imported: format!("{name}/Import"),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_suffix_match() {
        let resolver = TopicResolver::new(&phases());
        assert_eq!(
            resolver.resolve("site/L1/Power"),
            Some(Binding {
                phase: 0,
                field: Field::Power
            })
        );
        assert_eq!(
            resolver.resolve("site/L2/Power"),
            Some(Binding {
                phase: 1,
                field: Field::Power
            })
        );
        assert_eq!(
            resolver.resolve("L3/Import"),
            Some(Binding {
                phase: 2,
                field: Field::Imported
            })
        );
    }

    #[test]
    fn test_rejects_substring_and_case_mismatch() {
        let lines = vec![PhaseLine::new(
            "L1",
            TopicBindings {
                power: "Power".to_string(),
                ..Default::default()
            },
        )];
        let resolver = TopicResolver::new(&lines);
        assert_eq!(resolver.resolve("other/ApowerX"), None);
        assert_eq!(resolver.resolve("other/PowerX"), None);
        assert_eq!(resolver.resolve("other/power"), None);
        assert!(resolver.resolve("other/Power").is_some());
    }

    #[test]
    fn test_resolution_is_memoized() {
        let resolver = TopicResolver::new(&phases());
        let first = resolver.resolve("site/L2/Voltage");
        for _ in 0..10 {
            assert_eq!(resolver.resolve("site/L2/Voltage"), first);
        }
        assert_eq!(resolver.scan_count(), 1);
    }

    #[test]
    fn test_misses_are_memoized() {
        let resolver = TopicResolver::new(&phases());
        assert_eq!(resolver.resolve("site/L1/Frequency"), None);
        assert_eq!(resolver.resolve("site/L1/Frequency"), None);
        assert_eq!(resolver.scan_count(), 1);
        assert_eq!(resolver.cached_topics(), 1);
    }

    #[test]
    fn test_first_binding_in_scan_order_wins() {
        let lines = vec![
            PhaseLine::new(
                "L1",
                TopicBindings {
                    power: "Power".to_string(),
                    ..Default::default()
                },
            ),
            PhaseLine::new(
                "L2",
                TopicBindings {
                    voltage: "L2/Power".to_string(),
                    power: "L2/Power".to_string(),
                    ..Default::default()
                },
            ),
        ];
        let resolver = TopicResolver::new(&lines);
        assert_eq!(
            resolver.resolve("meter/L2/Power"),
            Some(Binding {
                phase: 0,
                field: Field::Power
            })
        );

        let resolver = TopicResolver::new(&lines[1..]);
        assert_eq!(
            resolver.resolve("meter/L2/Power"),
            Some(Binding {
                phase: 0,
                field: Field::Voltage
            })
        );
    }

    #[test]
    fn test_empty_bindings_never_match() {
        let lines = vec![PhaseLine::new("L1", TopicBindings::default())];
        let resolver = TopicResolver::new(&lines);
        assert_eq!(resolver.resolve("anything/at/all"), None);
    }

    #[test]
    fn test_concurrent_first_resolution_scans_once() {
        let resolver = Arc::new(TopicResolver::new(&phases()));
        let barrier = Arc::new(Barrier::new(100));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    resolver.resolve("site/L3/Power")
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.join().unwrap(),
                Some(Binding {
                    phase: 2,
                    field: Field::Power
                })
            );
        }
        assert_eq!(resolver.scan_count(), 1);
    }
}
