//! Capability registry: catalog of worker runtimes and best-fit matching.
//!
//! Session counters are the only state mutated by multiple logical callers,
//! so capacity is checked and incremented as one operation under a single
//! lock. Batch matching uses a per-call simulated delta overlay instead of
//! mutating real counters: a greedy, single-pass bin-pack that trades
//! global optimality for scheduling latency.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Bead, BeadPriority};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Online,
    Degraded,
    Offline,
}

/// Capability/capacity descriptor for a worker runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeRegistration {
    pub key: String,
    pub display_name: String,
    pub supported_roles: Vec<String>,
    pub max_concurrency: u32,
    pub active_sessions: u32,
    /// Preference weight; higher wins
    pub weight: f64,
    /// Relative cost hint, informational only
    pub cost_per_session: f64,
    pub capabilities: Vec<String>,
    pub health: HealthStatus,
}

impl RuntimeRegistration {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        key: S1,
        display_name: S2,
        supported_roles: Vec<String>,
        max_concurrency: u32,
    ) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(Error::validation("Registration key cannot be empty"));
        }
        if supported_roles.is_empty() {
            return Err(Error::validation(
                "Registration must support at least one role",
            ));
        }
        if max_concurrency == 0 {
            return Err(Error::validation(
                "Registration max_concurrency must be at least 1",
            ));
        }
        Ok(Self {
            key,
            display_name: display_name.into(),
            supported_roles,
            max_concurrency,
            active_sessions: 0,
            weight: 1.0,
            cost_per_session: 0.0,
            capabilities: Vec::new(),
            health: HealthStatus::Online,
        })
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_session = cost;
        self
    }

    pub fn supports_role(&self, role: &str) -> bool {
        self.supported_roles.iter().any(|r| r == role)
    }

    pub fn has_all_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    pub fn is_online(&self) -> bool {
        self.health == HealthStatus::Online
    }

    /// Spare capacity given `extra` sessions already promised this call.
    fn remaining_capacity(&self, extra: u32) -> u32 {
        self.max_concurrency
            .saturating_sub(self.active_sessions)
            .saturating_sub(extra)
    }

    /// Load-adjusted preference: `weight * (1 - active/max)`.
    fn load_adjusted_score(&self, extra: u32) -> f64 {
        let load =
            (self.active_sessions + extra) as f64 / self.max_concurrency as f64;
        self.weight * (1.0 - load)
    }
}

/// Matching strategy seam. The default is greedy and single-pass; a global
/// optimum solver can be substituted without touching the dispatcher.
pub trait BeadMatcher: Send + Sync {
    /// Assign beads to registration keys. Beads are expected in priority
    /// order; no key may receive more assignments than its remaining
    /// capacity within one call.
    fn assign(
        &self,
        beads: &[Bead],
        registrations: &[RuntimeRegistration],
        required_capabilities: &[String],
    ) -> HashMap<Uuid, String>;
}

#[derive(Debug, Default)]
pub struct GreedyMatcher;

impl GreedyMatcher {
    fn pick<'a>(
        bead: &Bead,
        registrations: &'a [RuntimeRegistration],
        required_capabilities: &[String],
        overlay: &HashMap<String, u32>,
    ) -> Option<&'a RuntimeRegistration> {
        let survivors = registrations.iter().filter(|reg| {
            let extra = overlay.get(&reg.key).copied().unwrap_or(0);
            reg.is_online()
                && reg.supports_role(&bead.role)
                && reg.remaining_capacity(extra) > 0
                && reg.has_all_capabilities(required_capabilities)
        });

        // Critical beads take the highest weight unconditionally; everyone
        // else gets load-adjusted scoring. Strict comparison keeps the
        // earliest-registered winner on ties.
        let mut best: Option<(&RuntimeRegistration, f64)> = None;
        for reg in survivors {
            let extra = overlay.get(&reg.key).copied().unwrap_or(0);
            let score = if bead.priority == BeadPriority::Critical {
                reg.weight
            } else {
                reg.load_adjusted_score(extra)
            };
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((reg, score)),
            }
        }
        best.map(|(reg, _)| reg)
    }
}

impl BeadMatcher for GreedyMatcher {
    fn assign(
        &self,
        beads: &[Bead],
        registrations: &[RuntimeRegistration],
        required_capabilities: &[String],
    ) -> HashMap<Uuid, String> {
        let mut overlay: HashMap<String, u32> = HashMap::new();
        let mut assignments = HashMap::new();

        for bead in beads {
            if let Some(reg) = Self::pick(bead, registrations, required_capabilities, &overlay) {
                *overlay.entry(reg.key.clone()).or_insert(0) += 1;
                assignments.insert(bead.id, reg.key.clone());
            } else {
                debug!(bead_id = %bead.id, role = %bead.role, "No runtime for bead this pass");
            }
        }
        assignments
    }
}

/// Registry of runtime registrations, keyed by a unique identifier.
/// Insertion order is preserved for deterministic tie-breaking.
pub struct CapabilityRegistry {
    inner: Mutex<Vec<RuntimeRegistration>>,
    matcher: Box<dyn BeadMatcher>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            matcher: Box::new(GreedyMatcher),
        }
    }

    pub fn with_matcher(matcher: Box<dyn BeadMatcher>) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            matcher,
        }
    }

    pub async fn register(&self, registration: RuntimeRegistration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.iter().any(|r| r.key == registration.key) {
            return Err(Error::validation(format!(
                "Registration key '{}' already exists",
                registration.key
            )));
        }
        debug!(key = %registration.key, roles = ?registration.supported_roles, "Registered runtime");
        inner.push(registration);
        Ok(())
    }

    pub async fn unregister(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.len();
        inner.retain(|r| r.key != key);
        inner.len() != before
    }

    /// Atomically check capacity and increment the active-session count.
    /// Returns false when the registration is saturated.
    pub async fn acquire_session(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let reg = inner
            .iter_mut()
            .find(|r| r.key == key)
            .ok_or_else(|| Error::not_found("RuntimeRegistration", key))?;
        if reg.active_sessions >= reg.max_concurrency {
            return Ok(false);
        }
        reg.active_sessions += 1;
        Ok(true)
    }

    pub async fn release_session(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let reg = inner
            .iter_mut()
            .find(|r| r.key == key)
            .ok_or_else(|| Error::not_found("RuntimeRegistration", key))?;
        if reg.active_sessions == 0 {
            warn!(key = %key, "Session release on idle registration");
            return Ok(());
        }
        reg.active_sessions -= 1;
        Ok(())
    }

    pub async fn mark_health(&self, key: &str, health: HealthStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let reg = inner
            .iter_mut()
            .find(|r| r.key == key)
            .ok_or_else(|| Error::not_found("RuntimeRegistration", key))?;
        reg.health = health;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<RuntimeRegistration> {
        self.inner.lock().await.iter().find(|r| r.key == key).cloned()
    }

    pub async fn snapshot(&self) -> Vec<RuntimeRegistration> {
        self.inner.lock().await.clone()
    }

    /// Sum of online registrations' `max_concurrency`: the dispatcher's
    /// concurrency bound.
    pub async fn total_capacity(&self) -> usize {
        self.inner
            .lock()
            .await
            .iter()
            .filter(|r| r.is_online())
            .map(|r| r.max_concurrency as usize)
            .sum()
    }

    /// Best-fit match for a single bead. Never returns a saturated
    /// registration.
    pub async fn match_bead(
        &self,
        bead: &Bead,
        required_capabilities: &[String],
    ) -> Option<RuntimeRegistration> {
        let inner = self.inner.lock().await;
        let assignments =
            self.matcher
                .assign(std::slice::from_ref(bead), &inner, required_capabilities);
        assignments
            .get(&bead.id)
            .and_then(|key| inner.iter().find(|r| &r.key == key))
            .cloned()
    }

    /// Batch match in priority order (critical -> high -> medium -> low).
    /// Capacity promised earlier in the pass is tracked via the matcher's
    /// overlay, never by mutating real counters.
    pub async fn match_beads(
        &self,
        beads: &[Bead],
        required_capabilities: &[String],
    ) -> HashMap<Uuid, String> {
        let mut ordered: Vec<Bead> = beads.to_vec();
        ordered.sort_by_key(|b| b.priority);
        let inner = self.inner.lock().await;
        self.matcher.assign(&ordered, &inner, required_capabilities)
    }
}
