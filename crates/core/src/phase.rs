//! Phase catalog: the ordered steps of a logical unit's pipeline.
//!
//! The registry is a pure, immutable lookup table. Every phase carries an
//! equal share (`100 / N`) of the unit's overall progress.

use serde::{Deserialize, Serialize};

use crate::error::{PhaseError, PhaseResult};
use crate::id::JobId;

/// Default integration pipeline (name, description), in execution order.
pub const INTEGRATION_PHASES: &[(&str, &str)] = &[
    ("INIT", "Validate credentials and seed the sync window"),
    ("ORDERS", "Fetch order and sales reports"),
    ("ADVERTISING", "Fetch advertising campaign reports"),
    ("INVENTORY", "Fetch inventory, fee and reimbursement reports"),
    ("FINALIZE", "Compute analytics and publish the summary"),
];

/// Definition of a phase before it is placed in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseDef {
    pub name: String,
    pub description: String,
}

impl PhaseDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Immutable catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub index: usize,
    pub description: String,
    /// Share of overall progress, in percent (`100 / N`).
    pub weight: f64,
}

/// Ordered, fixed set of phases with transition rules.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRegistry {
    phases: Vec<Phase>,
}

impl PhaseRegistry {
    /// Build a registry from ordered definitions.
    ///
    /// Fails on an empty list, blank/whitespace names or duplicates.
    pub fn new(defs: impl IntoIterator<Item = PhaseDef>) -> PhaseResult<Self> {
        let defs: Vec<PhaseDef> = defs.into_iter().collect();
        if defs.is_empty() {
            return Err(PhaseError::invalid_registry("at least one phase is required"));
        }

        let weight = 100.0 / defs.len() as f64;
        let mut phases: Vec<Phase> = Vec::with_capacity(defs.len());
        for (index, def) in defs.into_iter().enumerate() {
            if def.name.is_empty() || def.name.chars().any(char::is_whitespace) {
                return Err(PhaseError::invalid_registry(format!(
                    "phase name {:?} is blank or contains whitespace",
                    def.name
                )));
            }
            if phases.iter().any(|p| p.name == def.name) {
                return Err(PhaseError::invalid_registry(format!(
                    "duplicate phase {}",
                    def.name
                )));
            }
            phases.push(Phase {
                name: def.name,
                index,
                description: def.description,
                weight,
            });
        }

        Ok(Self { phases })
    }

    /// Build a registry from `(name, description)` pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> PhaseResult<Self> {
        Self::new(pairs.iter().map(|(n, d)| PhaseDef::new(*n, *d)))
    }

    /// The default integration pipeline ([`INTEGRATION_PHASES`]).
    pub fn integration() -> Self {
        Self {
            phases: INTEGRATION_PHASES
                .iter()
                .enumerate()
                .map(|(index, (name, description))| Phase {
                    name: (*name).to_string(),
                    index,
                    description: (*description).to_string(),
                    weight: 100.0 / INTEGRATION_PHASES.len() as f64,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }

    /// Progress share of each phase, in percent.
    pub fn weight(&self) -> f64 {
        100.0 / self.phases.len() as f64
    }

    pub fn get(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Like [`Self::get`], but an unknown name is an error.
    pub fn resolve(&self, name: &str) -> PhaseResult<&Phase> {
        self.get(name).ok_or_else(|| PhaseError::unknown_phase(name))
    }

    pub fn first(&self) -> &Phase {
        &self.phases[0]
    }

    pub fn last(&self) -> &Phase {
        &self.phases[self.phases.len() - 1]
    }

    /// Phase following `current`; `None` at the terminal phase or when
    /// `current` is not a known phase.
    pub fn next_phase(&self, current: &str) -> Option<&Phase> {
        let phase = self.get(current)?;
        self.phases.get(phase.index + 1)
    }

    pub fn is_first(&self, name: &str) -> bool {
        self.index(name) == Some(0)
    }

    pub fn is_last(&self, name: &str) -> bool {
        self.index(name) == Some(self.phases.len() - 1)
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.get(name).map(|p| p.index)
    }

    /// Overall unit progress (0..=100) for a phase at a phase-local progress.
    ///
    /// `index * weight + (local / 100) * weight`, with `local` clamped to
    /// `0..=100`.
    pub fn overall_progress(&self, phase: &str, local_progress: f64) -> PhaseResult<f64> {
        let phase = self.resolve(phase)?;
        let local = local_progress.clamp(0.0, 100.0);
        let progress = phase.index as f64 * phase.weight + (local / 100.0) * phase.weight;
        Ok(progress.min(100.0))
    }

    /// [`Self::overall_progress`] rounded to a whole percent.
    pub fn overall_progress_percent(&self, phase: &str, local_progress: f64) -> PhaseResult<u8> {
        Ok(self.overall_progress(phase, local_progress)?.round() as u8)
    }

    /// Deterministic job id: `{parent_id}-{phase}`.
    pub fn job_id(&self, parent_id: &str, phase: &Phase) -> JobId {
        JobId::from_raw(format!("{parent_id}-{}", phase.name))
    }

    /// Inverse of [`Self::job_id`]: split a job id into parent id and phase.
    ///
    /// The longest matching phase suffix wins, so a phase whose name is a
    /// suffix of another (`ENTORY` / `INVENTORY`) is never mis-parsed.
    pub fn parse_job_id<'a>(&self, job_id: &'a JobId) -> PhaseResult<(&'a str, &Phase)> {
        let raw = job_id.as_str();
        let mut candidates: Vec<&Phase> = self.phases.iter().collect();
        candidates.sort_by_key(|p| std::cmp::Reverse(p.name.len()));

        for phase in candidates {
            let Some(head) = raw.strip_suffix(phase.name.as_str()) else {
                continue;
            };
            if let Some(parent) = head.strip_suffix('-') {
                if !parent.is_empty() {
                    return Ok((parent, phase));
                }
            }
        }

        Err(PhaseError::MalformedJobId(raw.to_string()))
    }

    /// Parent id of a job id (the unit it belongs to).
    pub fn parent_id<'a>(&self, job_id: &'a JobId) -> PhaseResult<&'a str> {
        self.parse_job_id(job_id).map(|(parent, _)| parent)
    }
}

impl Default for PhaseRegistry {
    fn default() -> Self {
        Self::integration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn three_phase() -> PhaseRegistry {
        PhaseRegistry::from_pairs(&[("INIT", "init"), ("BATCH", "batch"), ("FINALIZE", "final")])
            .unwrap()
    }

    #[test]
    fn rejects_empty_and_duplicate_definitions() {
        assert!(PhaseRegistry::new(Vec::new()).is_err());
        assert!(PhaseRegistry::from_pairs(&[("A", ""), ("A", "")]).is_err());
        assert!(PhaseRegistry::from_pairs(&[("A B", "")]).is_err());
    }

    #[test]
    fn transitions_follow_registry_order() {
        let registry = three_phase();

        assert_eq!(registry.next_phase("INIT").map(|p| p.name.as_str()), Some("BATCH"));
        assert_eq!(registry.next_phase("BATCH").map(|p| p.name.as_str()), Some("FINALIZE"));
        assert!(registry.next_phase("FINALIZE").is_none());
        assert!(registry.next_phase("NOPE").is_none());

        assert!(registry.is_first("INIT"));
        assert!(!registry.is_first("BATCH"));
        assert!(registry.is_last("FINALIZE"));
        assert!(!registry.is_last("NOPE"));
        assert_eq!(registry.index("BATCH"), Some(1));
        assert_eq!(registry.index("NOPE"), None);
    }

    #[test]
    fn five_phase_base_progress() {
        let registry = PhaseRegistry::integration();
        assert_eq!(registry.len(), 5);

        let bases: Vec<f64> = registry
            .phases()
            .iter()
            .map(|p| registry.overall_progress(&p.name, 0.0).unwrap())
            .collect();
        assert_eq!(bases, vec![0.0, 20.0, 40.0, 60.0, 80.0]);

        assert_eq!(registry.overall_progress("ORDERS", 50.0).unwrap(), 30.0);
        assert_eq!(registry.overall_progress("FINALIZE", 100.0).unwrap(), 100.0);
        assert_eq!(registry.overall_progress("FINALIZE", 250.0).unwrap(), 100.0);
        assert!(registry.overall_progress("NOPE", 0.0).is_err());
    }

    #[test]
    fn three_phase_progress_rounds_to_thirds() {
        let registry = three_phase();
        assert_eq!(registry.overall_progress_percent("INIT", 0.0).unwrap(), 0);
        assert_eq!(registry.overall_progress_percent("BATCH", 0.0).unwrap(), 33);
        assert_eq!(registry.overall_progress_percent("FINALIZE", 0.0).unwrap(), 67);
        assert_eq!(registry.overall_progress_percent("FINALIZE", 100.0).unwrap(), 100);
    }

    #[test]
    fn job_ids_are_derived_and_parsed() {
        let registry = three_phase();
        let batch = registry.resolve("BATCH").unwrap();

        let id = registry.job_id("user-42", batch);
        assert_eq!(id.as_str(), "user-42-BATCH");

        let (parent, phase) = registry.parse_job_id(&id).unwrap();
        assert_eq!(parent, "user-42");
        assert_eq!(phase.name, "BATCH");

        assert!(registry.parent_id(&JobId::from("user-42")).is_err());
        assert!(registry.parent_id(&JobId::from("-INIT")).is_err());
        assert!(registry.parent_id(&JobId::from("user-42INIT")).is_err());
    }

    #[test]
    fn longest_suffix_wins() {
        let registry =
            PhaseRegistry::from_pairs(&[("ENTORY", ""), ("INVENTORY", "")]).unwrap();
        let inventory = registry.resolve("INVENTORY").unwrap();
        let id = registry.job_id("acme", inventory);

        let (parent, phase) = registry.parse_job_id(&id).unwrap();
        assert_eq!(parent, "acme");
        assert_eq!(phase.name, "INVENTORY");
    }

    proptest! {
        #[test]
        fn progress_is_monotonic(
            n in 1usize..12,
            a in (0usize..12, 0.0f64..=100.0),
            b in (0usize..12, 0.0f64..=100.0),
        ) {
            let names: Vec<String> = (0..n).map(|i| format!("P{i}")).collect();
            let registry = PhaseRegistry::new(names.iter().map(|n| PhaseDef::new(n.clone(), ""))).unwrap();

            let a = (a.0 % n, a.1);
            let b = (b.0 % n, b.1);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

            let x = registry.overall_progress(&names[lo.0], lo.1).unwrap();
            let y = registry.overall_progress(&names[hi.0], hi.1).unwrap();
            prop_assert!(x <= y + 1e-9);
            prop_assert!((0.0..=100.0).contains(&y));
        }

        #[test]
        fn parse_inverts_derive(parent in "[a-z0-9][a-z0-9-]{0,24}", idx in 0usize..5) {
            let registry = PhaseRegistry::integration();
            let phase = &registry.phases()[idx];
            let id = registry.job_id(&parent, phase);
            let (parsed, parsed_phase) = registry.parse_job_id(&id).unwrap();
            prop_assert_eq!(parsed, parent.as_str());
            prop_assert_eq!(&parsed_phase.name, &phase.name);
        }
    }
}
