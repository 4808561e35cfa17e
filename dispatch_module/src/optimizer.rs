//! Greedy provider allocation for a batch of simultaneously-due jobs,
//! honoring per-batch capacity counters so a burst cannot pile onto one
//! provider.

use std::collections::HashMap;

use mailer_module::provider_default;
use tracing::{debug, warn};

use crate::routing::{find_first_matching_route, sort_providers_by_usage, SelectionSettings};
use crate::sendlog::SendLog;
use crate::store::ScheduledJob;

const UNLIMITED: i64 = 1 << 30;

/// Pluggable allocation strategy for a batch of jobs.
pub trait BatchOptimizer {
    /// Map of job id to the provider chosen for it.
    fn allocate_jobs(&self, jobs: &[ScheduledJob]) -> HashMap<String, String>;
}

/// Assigns the most constrained jobs first and walks each job's ranked
/// candidates, decrementing shared capacity counters.
pub struct GreedyBatchOptimizer {
    send_log: SendLog,
}

impl GreedyBatchOptimizer {
    pub fn new(send_log: SendLog) -> Self {
        Self { send_log }
    }

    /// Candidate providers for one job, ordered. Route rate limits are not
    /// applied here; allocation owns capacity instead.
    fn candidates(&self, job: &ScheduledJob) -> Vec<String> {
        let msg = &job.message;
        let mut cands: Vec<String> = if !msg.provider_priority.is_empty() {
            msg.provider_priority.clone()
        } else {
            let mut from_route = find_first_matching_route(msg)
                .map(|route| route.providers())
                .unwrap_or_default();
            if from_route.is_empty() && !msg.provider.is_empty() {
                from_route.push(msg.provider.clone());
            }
            from_route
        };
        cands = cands
            .iter()
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        if cands.len() < 2 {
            return cands;
        }

        match find_first_matching_route(msg) {
            Some(route) => {
                if !route.provider_weights.is_empty() || !route.provider_cost_overrides.is_empty() {
                    // Cost/weight hints outrank even an explicit priority
                    // list.
                    debug!(job_id = %job.id, ?cands, "optimizer: reordering by usage");
                    cands = sort_providers_by_usage(
                        &self.send_log,
                        &cands,
                        &SelectionSettings::from_route(route),
                    );
                } else if !route.provider_priority.is_empty() {
                    cands = prefer_declared_order(&route.provider_priority, cands);
                } else if msg.provider_priority.is_empty() {
                    cands = sort_providers_by_usage(
                        &self.send_log,
                        &cands,
                        &SelectionSettings::default(),
                    );
                }
            }
            None => {
                if msg.provider_priority.is_empty() {
                    cands = sort_providers_by_usage(
                        &self.send_log,
                        &cands,
                        &SelectionSettings::default(),
                    );
                }
            }
        }
        cands
    }
}

impl BatchOptimizer for GreedyBatchOptimizer {
    fn allocate_jobs(&self, jobs: &[ScheduledJob]) -> HashMap<String, String> {
        let mut wrapped: Vec<(&ScheduledJob, Vec<String>)> = jobs
            .iter()
            .map(|job| (job, self.candidates(job)))
            .collect();
        // Most constrained first; id keeps the order deterministic.
        wrapped.sort_by(|a, b| {
            a.1.len()
                .cmp(&b.1.len())
                .then_with(|| a.0.id.cmp(&b.0.id))
        });

        let mut assignments = HashMap::new();
        let mut counts: HashMap<String, i64> = HashMap::new();

        for (job, cands) in &wrapped {
            if cands.is_empty() {
                warn!(job_id = %job.id, "optimizer: no candidates for job");
                continue;
            }
            let route = find_first_matching_route(&job.message);
            let remaining: HashMap<&str, i64> = cands
                .iter()
                .map(|prov| {
                    let cap = route
                        .and_then(|r| r.provider_capacities.get(prov).copied())
                        .filter(|cap| *cap > 0)
                        .map(i64::from)
                        .or_else(|| {
                            provider_default(prov)
                                .filter(|d| d.capacity > 0)
                                .map(|d| i64::from(d.capacity))
                        })
                        .unwrap_or(UNLIMITED);
                    (
                        prov.as_str(),
                        cap - counts.get(prov.as_str()).copied().unwrap_or(0),
                    )
                })
                .collect();

            // Highest-ranked candidate with remaining capacity; when the
            // whole list is saturated, degrade to the least oversubscribed
            // one, tie-break by lower cost.
            let chosen = cands
                .iter()
                .find(|prov| remaining.get(prov.as_str()).copied().unwrap_or(0) > 0)
                .cloned()
                .unwrap_or_else(|| {
                    cands
                        .iter()
                        .max_by(|a, b| {
                            let rem_a = remaining.get(a.as_str()).copied().unwrap_or(0);
                            let rem_b = remaining.get(b.as_str()).copied().unwrap_or(0);
                            rem_a.cmp(&rem_b).then_with(|| {
                                default_cost(b)
                                    .partial_cmp(&default_cost(a))
                                    .unwrap_or(std::cmp::Ordering::Equal)
                            })
                        })
                        .cloned()
                        .unwrap_or_default()
                });

            *counts.entry(chosen.clone()).or_insert(0) += 1;
            debug!(job_id = %job.id, provider = %chosen, "optimizer: assigned");
            assignments.insert(job.id.clone(), chosen);
        }
        assignments
    }
}

/// Keep the route's declared provider order for candidates it names,
/// appending any leftovers in their existing order.
fn prefer_declared_order(declared: &[String], cands: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(cands.len());
    for name in declared {
        let name = name.trim().to_ascii_lowercase();
        if cands.contains(&name) && !out.contains(&name) {
            out.push(name);
        }
    }
    for name in cands {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

fn default_cost(provider: &str) -> f64 {
    provider_default(provider)
        .map(|d| d.cost)
        .filter(|cost| *cost > 0.0)
        .unwrap_or(1.0)
}
