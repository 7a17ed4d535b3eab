//! Value pipeline: topic → phase field → derived values → totals → device.

use crate::aggregator::{Aggregator, Totals};
use crate::config::{DerivedValues, FactorConfig};
use crate::device_state::Publisher;
use crate::error::IngestError;
use crate::phase::{Field, PhaseLine};
use crate::resolver::{Binding, TopicResolver};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

struct MeterState {
    phases: Vec<PhaseLine>,
    aggregator: Aggregator,
}

/// Copy of the meter readings at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub phases: Vec<PhaseLine>,
    pub totals: Totals,
}

/// One pending device update, collected under the state lock.
struct Publication {
    path: String,
    value: f64,
    unit: &'static str,
}

pub struct Bridge<P: Publisher> {
    resolver: TopicResolver,
    state: Mutex<MeterState>,
    publisher: P,
    factors: FactorConfig,
    derived_values: DerivedValues,
    processed: AtomicU64,
}

impl<P: Publisher> Bridge<P> {
    /// # Panics
    ///
    /// Panics if more than [`Aggregator::MAX_PHASES`] phases are given.
    pub fn new(
        phases: Vec<PhaseLine>,
        factors: FactorConfig,
        derived_values: DerivedValues,
        publisher: P,
    ) -> Self {
        let resolver = TopicResolver::new(&phases);
        let aggregator = Aggregator::new(phases.len());
        Self {
            resolver,
            state: Mutex::new(MeterState { phases, aggregator }),
            publisher,
            factors,
            derived_values,
            processed: AtomicU64::new(0),
        }
    }

    /// Applies one bus message.
    ///
    /// Returns the binding that was updated, or `None` when no phase field is
    /// bound to `topic`. A payload that is not a finite number leaves the
    /// state untouched.
    pub fn ingest(&self, topic: &str, payload: &[u8]) -> Result<Option<Binding>, IngestError> {
        let Some(binding) = self.resolver.resolve(topic) else {
            trace!(topic, "ignoring unbound topic");
            return Ok(None);
        };

        let raw = String::from_utf8_lossy(payload);
        let value: f64 = raw
            .trim()
            .parse()
            .map_err(|source| IngestError::PayloadParse {
                topic: topic.to_string(),
                payload: raw.to_string(),
                source,
            })?;

        // `f64::from_str` accepts "NaN", "inf" and overflowing literals.
        let value = self.calibrate(binding.field, value);
        if !value.is_finite() {
            return Err(IngestError::NonFinite {
                topic: topic.to_string(),
                payload: raw.to_string(),
            });
        }

        self.apply(binding, value);
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(Some(binding))
    }

    fn calibrate(&self, field: Field, value: f64) -> f64 {
        match field {
            Field::Imported => value * self.factors.imported,
            Field::Exported => value * self.factors.exported,
            _ => value,
        }
    }

    fn apply(&self, binding: Binding, value: f64) {
        let mut guard = self.lock_state();
        let MeterState { phases, aggregator } = &mut *guard;

        let line = &mut phases[binding.phase];
        line.set_field(binding.field, value);
        aggregator.record(binding.phase, binding.field);

        let mut updated = vec![binding.field];
        if binding.field == Field::Power {
            let derivation = line.derive_missing();
            if derivation.voltage_defaulted {
                updated.push(Field::Voltage);
            }
            updated.extend(derivation.derived);
        }

        debug!(
            phase = %line.name,
            voltage = line.voltage,
            current = line.current,
            power = line.power,
            imported = line.imported,
            exported = line.exported,
            "phase updated"
        );

        let mut publications: Vec<Publication> = updated
            .iter()
            .map(|&field| Publication {
                path: line.path(field),
                value: line.get(field),
                unit: field.unit(),
            })
            .collect();

        if let Some(aggregate) = aggregator.recompute_totals(&phases[..], binding.field) {
            publications.push(Publication {
                path: aggregate.path(),
                value: aggregate.value,
                unit: aggregate.field.unit(),
            });
        }

        // Publishing under the lock keeps device updates in state order; the
        // publisher contract forbids blocking.
        for publication in &publications {
            if let Err(e) =
                self.publisher
                    .publish(&publication.path, publication.value, publication.unit)
            {
                warn!(path = %publication.path, error = %e, "device update not delivered");
            }
        }

        if self.derived_values == DerivedValues::Transient {
            phases[binding.phase].clear_derived();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MeterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock_state();
        Snapshot {
            phases: state.phases.clone(),
            totals: state.aggregator.totals(),
        }
    }

    /// Number of phases that have reported `field` at least once.
    pub fn reported(&self, field: Field) -> usize {
        self.lock_state().aggregator.reported(field)
    }

    pub fn resolver(&self) -> &TopicResolver {
        &self.resolver
    }

    /// Messages applied since the previous call.
    pub fn take_processed(&self) -> u64 {
        self.processed.swap(0, Ordering::Relaxed)
    }
}
