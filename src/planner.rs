//! Planner: turns a free-text change request into a convoy of beads with
//! dependency edges, execution groups and a risk estimate.
//!
//! Planning is all-or-nothing: the dependency graph is validated before a
//! single record is persisted, so a malformed plan leaves the ledger
//! untouched.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ledger::WorkLedger;
use crate::model::{Bead, BeadPriority, BeadStatus, Convoy, ConvoyProgress, ConvoyStatus, Rig};

/// One planned-but-not-yet-persisted bead. Dependencies reference other
/// drafts by index within the same plan.
#[derive(Debug, Clone)]
pub struct BeadDraft {
    pub title: String,
    pub description: String,
    pub role: String,
    pub priority: BeadPriority,
    pub depends_on: Vec<usize>,
    pub optional: bool,
}

impl BeadDraft {
    pub fn new<S1: Into<String>, S2: Into<String>>(title: S1, description: S2, role: &str) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            role: role.to_string(),
            priority: BeadPriority::Medium,
            depends_on: Vec::new(),
            optional: false,
        }
    }
}

/// Decomposition strategy seam. The default is a heuristic text splitter;
/// an LLM-backed decomposer slots in without touching the planner.
pub trait Decomposer: Send + Sync {
    fn decompose(&self, request: &str) -> Vec<BeadDraft>;
}

/// Splits a request on numbered steps or "then" connectives into a
/// sequential chain; anything else becomes a single bead.
#[derive(Debug, Default)]
pub struct HeuristicDecomposer;

impl HeuristicDecomposer {
    fn infer_role(step: &str) -> &'static str {
        let lower = step.to_lowercase();
        if lower.contains("frontend") || lower.contains(" ui ") || lower.starts_with("ui ") {
            "frontend"
        } else if lower.contains("test") || lower.contains("verify") {
            "qa"
        } else if lower.contains("document") || lower.contains("readme") {
            "docs"
        } else {
            "backend"
        }
    }

    fn numbered_steps(request: &str) -> Vec<String> {
        request
            .lines()
            .filter_map(|line| {
                let trimmed = line.trim();
                let rest = trimmed
                    .split_once('.')
                    .or_else(|| trimmed.split_once(')'))
                    .filter(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                    .map(|(_, rest)| rest.trim());
                rest.filter(|r| !r.is_empty()).map(str::to_string)
            })
            .collect()
    }
}

impl Decomposer for HeuristicDecomposer {
    fn decompose(&self, request: &str) -> Vec<BeadDraft> {
        let mut steps = Self::numbered_steps(request);
        if steps.len() < 2 {
            steps = request
                .split(" then ")
                .map(|s| s.trim().trim_end_matches(',').to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if steps.is_empty() {
            steps.push(request.trim().to_string());
        }

        steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let mut draft = BeadDraft::new(step.clone(), step.clone(), Self::infer_role(step));
                // Sequential chain: each step waits for the previous one
                if i > 0 {
                    draft.depends_on.push(i - 1);
                }
                draft
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A validated, persisted plan ready for dispatch.
#[derive(Debug, Clone)]
pub struct ConvoyPlan {
    pub convoy: Convoy,
    pub beads: Vec<Bead>,
    /// Beads grouped by dependency level; everything within a group can
    /// run concurrently
    pub groups: Vec<Vec<Uuid>>,
    pub depth: usize,
    pub risk: RiskLevel,
}

/// Final report assembled once a convoy reaches a terminal status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConvoyReport {
    pub convoy_id: Uuid,
    pub name: String,
    pub status: ConvoyStatus,
    /// Every bead terminal and every non-optional bead completed
    pub success: bool,
    pub progress: ConvoyProgress,
    pub failed_beads: Vec<String>,
}

pub struct Planner {
    ledger: Arc<dyn WorkLedger>,
    decomposer: Box<dyn Decomposer>,
    default_max_attempts: u32,
}

impl Planner {
    pub fn new(ledger: Arc<dyn WorkLedger>, default_max_attempts: u32) -> Self {
        Self {
            ledger,
            decomposer: Box::new(HeuristicDecomposer),
            default_max_attempts,
        }
    }

    pub fn with_decomposer(mut self, decomposer: Box<dyn Decomposer>) -> Self {
        self.decomposer = decomposer;
        self
    }

    /// Decompose, validate and persist a plan for work on `rig`. Nothing
    /// touches the ledger until the dependency graph is known to be
    /// acyclic.
    pub async fn plan<S1, S2>(
        &self,
        rig: &Rig,
        name: S1,
        request: S2,
        created_by: &str,
    ) -> Result<ConvoyPlan>
    where
        S1: Into<String>,
        S2: AsRef<str>,
    {
        let request = request.as_ref();
        let max_attempts = rig
            .settings
            .max_attempts
            .unwrap_or(self.default_max_attempts);
        let drafts = self.decomposer.decompose(request);
        if drafts.is_empty() {
            return Err(Error::malformed_plan("request decomposed into no work"));
        }
        for draft in &drafts {
            for dep in &draft.depends_on {
                if *dep >= drafts.len() {
                    return Err(Error::malformed_plan(format!(
                        "dependency index {dep} out of range"
                    )));
                }
            }
        }

        let levels = dependency_levels(&drafts)?;
        let depth = levels.iter().copied().max().map(|d| d + 1).unwrap_or(0);
        let risk = assess_risk(drafts.len(), depth);

        // Graph is valid; now build and persist
        let ids: Vec<Uuid> = drafts.iter().map(|_| Uuid::new_v4()).collect();
        let convoy = Convoy::new(name, created_by, ids.clone())?;

        let mut beads = Vec::with_capacity(drafts.len());
        for (i, draft) in drafts.iter().enumerate() {
            let mut builder = Bead::builder()
                .id(ids[i])
                .title(&draft.title)
                .description(&draft.description)
                .role(&draft.role)
                .priority(draft.priority)
                .convoy(convoy.id)
                .max_attempts(max_attempts)
                .optional(draft.optional);
            for dep in &draft.depends_on {
                builder = builder.dependency(ids[*dep]);
            }
            beads.push(builder.build()?);
        }

        self.ledger.create_convoy(convoy.clone()).await?;
        for bead in &beads {
            self.ledger.create_bead(bead.clone()).await?;
        }

        let mut groups: Vec<Vec<Uuid>> = vec![Vec::new(); depth];
        for (i, level) in levels.iter().enumerate() {
            groups[*level].push(ids[i]);
        }

        info!(
            convoy_id = %convoy.id,
            beads = beads.len(),
            depth,
            risk = ?risk,
            "Planned convoy"
        );
        Ok(ConvoyPlan {
            convoy,
            beads,
            groups,
            depth,
            risk,
        })
    }

    /// Assemble the terminal report for a convoy.
    pub async fn report(&self, convoy_id: Uuid) -> Result<ConvoyReport> {
        let convoy = self.ledger.get_convoy(convoy_id).await?;
        let beads = self.ledger.list_convoy_beads(convoy_id).await?;
        let progress = self.ledger.calculate_progress(convoy_id).await?;
        let failed_beads = beads
            .iter()
            .filter(|b| b.status == BeadStatus::Failed)
            .map(|b| b.title.clone())
            .collect();
        // Optional beads may fail without sinking the convoy
        let success = beads.iter().all(|b| b.status.is_terminal())
            && beads
                .iter()
                .filter(|b| !b.optional)
                .all(|b| b.status == BeadStatus::Completed);
        Ok(ConvoyReport {
            convoy_id,
            name: convoy.name,
            status: convoy.status,
            success,
            progress,
            failed_beads,
        })
    }
}

/// Kahn's algorithm over draft indices: each draft's level is one more
/// than its deepest dependency. Leftover nodes mean a cycle, reported
/// with a concrete path.
fn dependency_levels(drafts: &[BeadDraft]) -> Result<Vec<usize>> {
    let n = drafts.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, draft) in drafts.iter().enumerate() {
        for dep in &draft.depends_on {
            in_degree[i] += 1;
            dependents.entry(*dep).or_default().push(i);
        }
    }

    let mut levels = vec![0usize; n];
    let mut queue: Vec<usize> = (0..n).filter(|i| in_degree[*i] == 0).collect();
    let mut processed = 0;
    while let Some(node) = queue.pop() {
        processed += 1;
        for &dependent in dependents.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            levels[dependent] = levels[dependent].max(levels[node] + 1);
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if processed < n {
        let path = cycle_path(drafts, &in_degree);
        debug!(path = %path, "Dependency cycle detected");
        return Err(Error::malformed_plan(format!("dependency cycle: {path}")));
    }
    Ok(levels)
}

/// Walk dependency edges among the unprocessed nodes until one repeats.
fn cycle_path(drafts: &[BeadDraft], in_degree: &[usize]) -> String {
    let start = match in_degree.iter().position(|d| *d > 0) {
        Some(i) => i,
        None => return "unknown".to_string(),
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = drafts[current]
            .depends_on
            .iter()
            .copied()
            .find(|d| in_degree[*d] > 0);
        let Some(next) = next else { break };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            path.push(next);
            return path[pos..]
                .iter()
                .map(|&i| drafts[i].title.as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
        }
        path.push(next);
        current = next;
    }
    path.iter()
        .map(|&i| drafts[i].title.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Size and depth thresholds for the plan risk estimate.
fn assess_risk(bead_count: usize, depth: usize) -> RiskLevel {
    if bead_count > 12 || depth > 4 {
        RiskLevel::High
    } else if bead_count > 5 || depth > 2 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}
