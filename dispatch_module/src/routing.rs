//! Provider selection: explicit priority lists, conditional routes with
//! rate limits, and the usage-aware scorer that prefers the least-loaded,
//! cheapest provider over a recency-weighted window.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use mailer_module::{extract_domain, provider_default, split_address, Message, ProviderRoute};
use regex::Regex;
use tracing::debug;

use crate::sendlog::SendLog;

const DEFAULT_SELECTION_WINDOW: Duration = Duration::from_secs(24 * 3600);
const MIN_HALF_LIFE: Duration = Duration::from_secs(3600);
const SCORE_EPSILON: f64 = 1e-6;
const SCORE_TIE: f64 = 1e-12;

/// Scoring inputs, usually lifted off the matching route.
#[derive(Debug, Clone, Default)]
pub struct SelectionSettings {
    pub to_domains: Vec<String>,
    pub window: Duration,
    pub half_life: Duration,
    pub weights: BTreeMap<String, f64>,
    pub capacities: BTreeMap<String, u32>,
    pub cost_overrides: BTreeMap<String, f64>,
}

impl SelectionSettings {
    pub fn from_route(route: &ProviderRoute) -> Self {
        Self {
            to_domains: route.to_domains.clone(),
            window: route.selection_window,
            half_life: route.recency_half_life,
            weights: route.provider_weights.clone(),
            capacities: route.provider_capacities.clone(),
            cost_overrides: route.provider_cost_overrides.clone(),
        }
    }
}

/// Resolve the ordered provider list for a message.
///
/// Precedence: an explicit priority list (usage-reordered, with route
/// scoring metadata when the first matching route carries any), then routes
/// in declaration order skipping exhausted ones, then the message's own
/// provider as a final fallback.
pub fn resolve_providers(msg: &Message, log: &SendLog) -> Vec<String> {
    if !msg.provider_priority.is_empty() {
        let settings = find_first_matching_route(msg)
            .filter(|route| route.has_selection_metadata())
            .map(SelectionSettings::from_route)
            .unwrap_or_default();
        let mut list = msg.provider_priority.clone();
        if list.len() > 1 {
            list = sort_providers_by_usage(log, &list, &settings);
        }
        return normalize_provider_list(list, &msg.provider);
    }

    for route in &msg.provider_routes {
        if !route_matches(msg, route) {
            continue;
        }
        if !route_within_limits(route, log) {
            debug!(to_domains = ?route.to_domains, "route skipped due to limits");
            continue;
        }
        let mut list = route.providers();
        if list.len() > 1 {
            list = sort_providers_by_usage(log, &list, &SelectionSettings::from_route(route));
        }
        return normalize_provider_list(list, &msg.provider);
    }

    normalize_provider_list(Vec::new(), &msg.provider)
}

/// A route matches when any recipient domain, the sender domain, or the
/// subject satisfies one of its conditions. Condition-free routes never
/// match.
pub fn route_matches(msg: &Message, route: &ProviderRoute) -> bool {
    if route.to_domains.is_empty() && route.from_domains.is_empty() && route.subject_regex.is_empty()
    {
        return false;
    }
    if !route.to_domains.is_empty() {
        for to in &msg.to {
            let (_, addr) = split_address(to);
            let domain = extract_domain(&addr);
            if route
                .to_domains
                .iter()
                .any(|candidate| candidate.trim().eq_ignore_ascii_case(&domain))
            {
                return true;
            }
        }
    }
    if !route.from_domains.is_empty() {
        let (_, addr) = split_address(&msg.from);
        let domain = extract_domain(&addr);
        if route
            .from_domains
            .iter()
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(&domain))
        {
            return true;
        }
    }
    if !route.subject_regex.is_empty() {
        if let Ok(re) = Regex::new(&route.subject_regex) {
            if re.is_match(&msg.subject) {
                return true;
            }
        }
    }
    false
}

pub fn find_first_matching_route<'a>(msg: &'a Message) -> Option<&'a ProviderRoute> {
    msg.provider_routes
        .iter()
        .find(|route| route_matches(msg, route))
}

/// A route is exhausted when any configured limit has been reached by
/// successful sends over its window. Count errors leave the route usable.
pub fn route_within_limits(route: &ProviderRoute, log: &SendLog) -> bool {
    let providers = route.providers();
    let now = Utc::now();
    let limits = [
        (route.hourly_limit, chrono::Duration::hours(1)),
        (route.daily_limit, chrono::Duration::hours(24)),
        (route.weekly_limit, chrono::Duration::days(7)),
        (route.monthly_limit, chrono::Duration::days(30)),
    ];
    for (limit, window) in limits {
        if limit == 0 {
            continue;
        }
        if let Ok(count) = log.count_successes_since(&providers, now - window, &route.to_domains) {
            if count >= limit as usize {
                return false;
            }
        }
    }
    true
}

struct Candidate {
    index: usize,
    score: f64,
    cost: f64,
    capacity: u32,
}

/// Order providers ascending by `(usage * weight * cost) / capacity`, with
/// a small cost-proportional epsilon so equal-usage candidates settle
/// toward the cheaper provider. Ties break by lower cost, then higher
/// capacity, then input order.
pub fn sort_providers_by_usage(
    log: &SendLog,
    providers: &[String],
    settings: &SelectionSettings,
) -> Vec<String> {
    let window = if settings.window.is_zero() {
        DEFAULT_SELECTION_WINDOW
    } else {
        settings.window
    };
    let mut half_life = settings.half_life;
    if half_life.is_zero() {
        half_life = window / 4;
        if half_life < MIN_HALF_LIFE {
            half_life = MIN_HALF_LIFE;
        }
    }
    let since = Utc::now()
        - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(24));
    // Read errors fall back to unweighted selection.
    let usage = log
        .weighted_usage_since(providers, since, &settings.to_domains, half_life)
        .unwrap_or_default();

    let mut candidates: Vec<Candidate> = providers
        .iter()
        .enumerate()
        .map(|(index, provider)| {
            let key = provider.trim().to_ascii_lowercase();
            let used = usage.get(&key).copied().unwrap_or(0.0);
            let weight = settings
                .weights
                .get(&key)
                .copied()
                .filter(|w| *w > 0.0)
                .unwrap_or(1.0);
            let (cost, capacity) = effective_cost_capacity(&key, settings);
            let capacity_factor = if capacity > 0 { capacity as f64 } else { 1.0 };
            let score = (used * weight * cost) / capacity_factor + SCORE_EPSILON * cost;
            debug!(
                provider = %key,
                weighted_usage = used,
                weight,
                cost,
                capacity,
                score,
                "scored provider"
            );
            Candidate {
                index,
                score,
                cost,
                capacity,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        if (a.score - b.score).abs() < SCORE_TIE {
            a.cost
                .partial_cmp(&b.cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.capacity.cmp(&a.capacity))
                .then(a.index.cmp(&b.index))
        } else {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }
    });

    candidates
        .into_iter()
        .map(|candidate| providers[candidate.index].clone())
        .collect()
}

/// Route-level overrides first, then registry defaults, then 1.0 cost and
/// unknown capacity.
pub(crate) fn effective_cost_capacity(provider: &str, settings: &SelectionSettings) -> (f64, u32) {
    let mut cost = settings
        .cost_overrides
        .get(provider)
        .copied()
        .filter(|c| *c > 0.0)
        .unwrap_or(0.0);
    let mut capacity = settings
        .capacities
        .get(provider)
        .copied()
        .filter(|c| *c > 0)
        .unwrap_or(0);
    if let Some(defaults) = provider_default(provider) {
        if cost == 0.0 && defaults.cost > 0.0 {
            cost = defaults.cost;
        }
        if capacity == 0 {
            capacity = defaults.capacity;
        }
    }
    if cost == 0.0 {
        cost = 1.0;
    }
    (cost, capacity)
}

/// Lowercase/trim names, drop duplicates preserving order, and append the
/// fallback provider. An empty result degrades to `[fallback]`, even when
/// the fallback itself is empty.
pub fn normalize_provider_list(list: Vec<String>, fallback: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for provider in list {
        let name = provider.trim().to_ascii_lowercase();
        if name.is_empty() || !seen.insert(name.clone()) {
            continue;
        }
        out.push(name);
    }
    let fallback = fallback.trim().to_ascii_lowercase();
    if !fallback.is_empty() && seen.insert(fallback.clone()) {
        out.push(fallback.clone());
    }
    if out.is_empty() {
        return vec![fallback];
    }
    out
}
