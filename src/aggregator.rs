//! System totals with completeness gating.
//!
//! Instantaneous power is republished on every phase power write. Energy
//! totals are withheld until every configured phase has reported the field at
//! least once, so a consumer never sees a counter drop because only some
//! phases have been heard from.

use crate::phase::{Field, PhaseLine};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
    pub power: f64,
    pub imported: f64,
    pub exported: f64,
}

impl Totals {
    pub fn sum(phases: &[PhaseLine]) -> Self {
        phases.iter().fold(Self::default(), |acc, line| Self {
            power: acc.power + line.power,
            imported: acc.imported + line.imported,
            exported: acc.exported + line.exported,
        })
    }

    pub fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::Power => Some(self.power),
            Field::Imported => Some(self.imported),
            Field::Exported => Some(self.exported),
            Field::Voltage | Field::Current => None,
        }
    }
}

/// One aggregate ready for publication.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub field: Field,
    pub value: f64,
}

impl Aggregate {
    pub fn path(&self) -> String {
        format!("/Ac/{}", self.field.path_segment())
    }
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    phase_count: usize,
    // One bit per phase that has reported the field, indexed by Field.
    reported: [u32; 5],
    totals: Totals,
}

impl Aggregator {
    /// Width of the per-field reported mask.
    pub const MAX_PHASES: usize = u32::BITS as usize;

    /// # Panics
    ///
    /// Panics if `phase_count` exceeds [`Aggregator::MAX_PHASES`].
    pub fn new(phase_count: usize) -> Self {
        assert!(
            phase_count <= Self::MAX_PHASES,
            "at most {} phases are supported, got {phase_count}",
            Self::MAX_PHASES
        );
        Self {
            phase_count,
            reported: [0; 5],
            totals: Totals::default(),
        }
    }

    /// Records an observed (not derived) reading of `field` on `phase`.
    pub fn record(&mut self, phase: usize, field: Field) {
        self.reported[field.index()] |= 1 << phase;
    }

    /// Number of distinct phases that have reported `field`.
    pub fn reported(&self, field: Field) -> usize {
        self.reported[field.index()].count_ones() as usize
    }

    pub fn is_complete(&self, field: Field) -> bool {
        self.reported(field) >= self.phase_count
    }

    /// Recomputes the totals after a write to `trigger` and returns the
    /// aggregate that may be published, if any.
    pub fn recompute_totals(&mut self, phases: &[PhaseLine], trigger: Field) -> Option<Aggregate> {
        self.totals = Totals::sum(phases);

        match trigger {
            Field::Power => Some(Aggregate {
                field: Field::Power,
                value: self.totals.power,
            }),
            Field::Imported | Field::Exported if self.is_complete(trigger) => {
                self.totals.get(trigger).map(|value| Aggregate {
                    field: trigger,
                    value,
                })
            }
            _ => None,
        }
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }
}
