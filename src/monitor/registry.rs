//! Registry of monitored targets.
//!
//! The target list is fixed after startup. Each target sits behind its own
//! lock; workers pick their next target through [`Registry::claim_next`],
//! which is the only place a target changes hands.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::state::TargetState;
use crate::config::{StatsConfig, TargetSpec};

/// A target behind its own lock.
#[derive(Debug)]
pub struct TargetSlot {
    /// Copy of the immutable `TargetState::id`, readable without the lock.
    id: i64,
    state: RwLock<TargetState>,
}

impl TargetSlot {
    pub fn new(state: TargetState) -> Self {
        Self {
            id: state.id,
            state: RwLock::new(state),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, TargetState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, TargetState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point-in-time copy of the state.
    pub fn snapshot(&self) -> TargetState {
        self.read().clone()
    }
}

/// Ordered collection of all monitored targets.
pub struct Registry {
    targets: Vec<Arc<TargetSlot>>,
    /// Serializes select-and-claim across workers.
    dispatch: Mutex<()>,
    started_at: DateTime<Utc>,
}

impl Registry {
    pub fn new(specs: Vec<TargetSpec>, now: DateTime<Utc>) -> Self {
        let targets = specs
            .into_iter()
            .map(|spec| Arc::new(TargetSlot::new(TargetState::new(spec, now))))
            .collect();

        Self {
            targets,
            dispatch: Mutex::new(()),
            started_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TargetSlot>> {
        self.targets.iter()
    }

    pub fn get(&self, id: i64) -> Option<&Arc<TargetSlot>> {
        self.targets.iter().find(|slot| slot.id() == id)
    }

    /// Pick the least recently probed target and mark it probed at `now`.
    ///
    /// Never-probed targets come first; ties go to registry order. Returns
    /// `None` when even the stalest target was probed less than
    /// `min_spacing` ago.
    pub fn claim_next(&self, now: DateTime<Utc>, min_spacing: Duration) -> Option<Arc<TargetSlot>> {
        let _guard = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);

        let mut oldest: Option<(&Arc<TargetSlot>, Option<DateTime<Utc>>)> = None;
        for slot in &self.targets {
            let probed = slot.read().last_probed_at;
            match oldest {
                // `None` orders before any timestamp.
                Some((_, best)) if probed >= best => {}
                _ => oldest = Some((slot, probed)),
            }
        }

        let (slot, probed) = oldest?;
        if let Some(last) = probed {
            let elapsed = (now - last).to_std().unwrap_or_default();
            if elapsed < min_spacing {
                return None;
            }
        }

        slot.write().last_probed_at = Some(now);
        Some(slot.clone())
    }

    /// Consistent copies of every target, in registry order.
    pub fn snapshot(&self) -> Vec<TargetState> {
        self.targets.iter().map(|slot| slot.snapshot()).collect()
    }

    pub fn abnormal_count(&self, cfg: &StatsConfig) -> usize {
        self.targets
            .iter()
            .filter(|slot| slot.read().classify(cfg).abnormal)
            .count()
    }
}
