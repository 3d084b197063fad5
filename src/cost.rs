//! Spend ceilings: one `RunBudget` shared by every concurrent subject, one
//! `SubjectLedger` per subject, and a `SpendGate` that checks both before a
//! live query is issued.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::CostScope;

const MICROS_PER_USD: f64 = 1_000_000.0;

fn to_micros(usd: f64) -> u64 {
    if !usd.is_finite() || usd <= 0.0 {
        return 0;
    }
    (usd * MICROS_PER_USD).round() as u64
}

fn to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Run-wide spend ceiling. Reservations go through a compare-and-swap loop
/// so concurrent subjects can never jointly overshoot the limit.
#[derive(Debug)]
pub struct RunBudget {
    limit: u64,
    spent: AtomicU64,
}

impl RunBudget {
    pub fn new(limit_usd: f64) -> Self {
        Self {
            limit: to_micros(limit_usd),
            spent: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limit: u64::MAX,
            spent: AtomicU64::new(0),
        }
    }

    /// Reserve `usd` if it fits under the limit. Zero-cost reservations always
    /// succeed, even on an exhausted budget.
    pub fn try_reserve(&self, usd: f64) -> bool {
        let want = to_micros(usd);
        if want == 0 {
            return true;
        }
        self.spent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(want).filter(|next| *next <= self.limit)
            })
            .is_ok()
    }

    /// Return part of a reservation that was not spent.
    pub fn refund(&self, usd: f64) {
        let back = to_micros(usd);
        if back == 0 {
            return;
        }
        let _ = self
            .spent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(back))
            });
    }

    pub fn spent(&self) -> f64 {
        to_usd(self.spent.load(Ordering::Acquire))
    }

    pub fn limit(&self) -> f64 {
        to_usd(self.limit)
    }

    pub fn remaining(&self) -> f64 {
        to_usd(self.limit.saturating_sub(self.spent.load(Ordering::Acquire)))
    }

    pub fn is_exhausted(&self) -> bool {
        self.spent.load(Ordering::Acquire) >= self.limit
    }
}

/// Per-subject spend. Owned by a single orchestrator call, so no atomics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectLedger {
    limit: u64,
    spent: u64,
}

impl SubjectLedger {
    pub fn new(limit_usd: f64) -> Self {
        Self {
            limit: to_micros(limit_usd),
            spent: 0,
        }
    }

    pub fn fits(&self, usd: f64) -> bool {
        self.spent.saturating_add(to_micros(usd)) <= self.limit
    }

    pub fn record(&mut self, usd: f64) {
        self.spent = self.spent.saturating_add(to_micros(usd));
    }

    pub fn spent(&self) -> f64 {
        to_usd(self.spent)
    }
}

/// Both ceilings that apply to one live query.
#[derive(Debug, Clone, Copy)]
pub struct SpendGate<'a> {
    pub subject: &'a SubjectLedger,
    pub run: &'a RunBudget,
}

/// Run-budget reservation held for the duration of one call.
#[derive(Debug)]
#[must_use = "a reservation must be settled"]
pub struct Reservation<'a> {
    run: &'a RunBudget,
    reserved: f64,
}

impl<'a> SpendGate<'a> {
    pub fn new(subject: &'a SubjectLedger, run: &'a RunBudget) -> Self {
        Self { subject, run }
    }

    /// Reserve `estimate` against both ceilings, subject first.
    pub fn reserve(&self, estimate: f64) -> Result<Reservation<'a>, CostScope> {
        let estimate = estimate.max(0.0);
        if estimate > 0.0 && !self.subject.fits(estimate) {
            return Err(CostScope::Subject);
        }
        if !self.run.try_reserve(estimate) {
            return Err(CostScope::Run);
        }
        Ok(Reservation {
            run: self.run,
            reserved: estimate,
        })
    }
}

impl Reservation<'_> {
    /// Keep `actual` (capped at the reserved amount) and refund the rest.
    /// Returns the amount charged.
    pub fn settle(self, actual: f64) -> f64 {
        let charged = if actual.is_finite() {
            actual.clamp(0.0, self.reserved)
        } else {
            self.reserved
        };
        self.run.refund(self.reserved - charged);
        charged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reservation_never_crosses_limit() {
        let b = RunBudget::new(0.05);
        assert!(b.try_reserve(0.02));
        assert!(b.try_reserve(0.02));
        assert!(!b.try_reserve(0.02));
        assert!(b.try_reserve(0.01));
        assert!(b.is_exhausted());
        assert!(b.try_reserve(0.0));
    }

    #[test]
    fn settle_refunds_unspent_part() {
        let run = RunBudget::new(1.0);
        let ledger = SubjectLedger::new(0.5);
        let gate = SpendGate::new(&ledger, &run);
        let r = gate.reserve(0.2).unwrap();
        assert!((run.spent() - 0.2).abs() < 1e-9);
        let charged = r.settle(0.0);
        assert_eq!(charged, 0.0);
        assert_eq!(run.spent(), 0.0);
    }

    #[test]
    fn subject_ceiling_checked_before_run() {
        let run = RunBudget::new(1.0);
        let mut ledger = SubjectLedger::new(0.1);
        ledger.record(0.08);
        let gate = SpendGate::new(&ledger, &run);
        assert_eq!(gate.reserve(0.05).unwrap_err(), CostScope::Subject);
        assert_eq!(run.spent(), 0.0);
    }

    #[test]
    fn concurrent_reservations_respect_limit() {
        let b = Arc::new(RunBudget::new(1.0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = b.clone();
                std::thread::spawn(move || (0..100).filter(|_| b.try_reserve(0.003)).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 333);
        assert!(b.spent() <= 1.0);
    }
}
