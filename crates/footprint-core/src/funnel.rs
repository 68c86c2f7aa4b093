//! Ordered funnel evaluation over session cohorts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Operation};
use crate::store::{EventStore, SessionActivity};
use crate::window::CohortWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchOperator {
    #[default]
    Equals,
    Contains,
}

/// Predicate a session must satisfy to reach a funnel step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepMatcher {
    /// Some pageview of the session has this path (exactly, or as a substring).
    PageMatch {
        path: String,
        #[serde(default)]
        operator: MatchOperator,
    },
    /// Some custom event of the session has exactly this name.
    EventMatch { name: String },
}

impl StepMatcher {
    pub fn page(path: impl Into<String>) -> Self {
        StepMatcher::PageMatch {
            path: path.into(),
            operator: MatchOperator::Equals,
        }
    }

    pub fn page_contains(path: impl Into<String>) -> Self {
        StepMatcher::PageMatch {
            path: path.into(),
            operator: MatchOperator::Contains,
        }
    }

    pub fn event(name: impl Into<String>) -> Self {
        StepMatcher::EventMatch { name: name.into() }
    }

    fn predicate(&self) -> &str {
        match self {
            StepMatcher::PageMatch { path, .. } => path,
            StepMatcher::EventMatch { name } => name,
        }
    }

    pub fn label(&self) -> String {
        match self {
            StepMatcher::PageMatch {
                path,
                operator: MatchOperator::Equals,
            } => format!("page {path}"),
            StepMatcher::PageMatch {
                path,
                operator: MatchOperator::Contains,
            } => format!("page contains {path}"),
            StepMatcher::EventMatch { name } => format!("event {name}"),
        }
    }
}

/// A funnel step as configured in a dashboard, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawStep {
    pub kind: String,
    pub predicate: String,
    #[serde(default)]
    pub operator: Option<String>,
}

/// A validated funnel: at least two steps, every predicate non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunnelDefinition {
    steps: Vec<StepMatcher>,
}

impl FunnelDefinition {
    pub fn new(steps: Vec<StepMatcher>) -> Result<Self, EngineError> {
        if steps.len() < 2 {
            return Err(EngineError::Validation(format!(
                "invalid funnel definition: needs at least 2 steps, got {}",
                steps.len()
            )));
        }
        if let Some(idx) = steps.iter().position(|s| s.predicate().trim().is_empty()) {
            return Err(EngineError::Validation(format!(
                "invalid funnel definition: step {} has an empty predicate",
                idx + 1
            )));
        }
        Ok(Self { steps })
    }

    /// Validate `{kind, predicate}` steps. Unknown kinds and operators are
    /// rejected here, before any cohort is read.
    pub fn from_raw(raw: &[RawStep]) -> Result<Self, EngineError> {
        let steps = raw
            .iter()
            .enumerate()
            .map(|(idx, step)| {
                let operator = match step.operator.as_deref().map(str::trim) {
                    None | Some("") | Some("equals") => MatchOperator::Equals,
                    Some("contains") => MatchOperator::Contains,
                    Some(other) => {
                        return Err(EngineError::Validation(format!(
                            "step {}: unrecognized operator {other:?}",
                            idx + 1
                        )))
                    }
                };
                match step.kind.trim() {
                    "page" | "page_match" | "pageview" => Ok(StepMatcher::PageMatch {
                        path: step.predicate.clone(),
                        operator,
                    }),
                    "event" | "event_match" if operator == MatchOperator::Equals => {
                        Ok(StepMatcher::event(step.predicate.clone()))
                    }
                    "event" | "event_match" => Err(EngineError::Validation(format!(
                        "step {}: event steps only support equality",
                        idx + 1
                    ))),
                    other => Err(EngineError::Validation(format!(
                        "step {}: unrecognized step kind {other:?}",
                        idx + 1
                    ))),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(steps)
    }

    pub fn steps(&self) -> &[StepMatcher] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStepResult {
    /// 1-based.
    pub step_index: usize,
    pub label: String,
    pub matched_session_count: u64,
    /// Percent of step 1's sessions that reached this step. In a cohort of 100
    /// where 40 sessions sign up and 10 create an account, step 2 reads 25
    /// here and 10 in `cohort_conversion_rate`.
    pub conversion_rate: f64,
    /// Percent of the previous step's sessions lost at this step.
    pub dropoff_rate: f64,
    /// Percent of the whole cohort that reached this step.
    pub cohort_conversion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelReport {
    pub cohort_sessions: u64,
    pub steps: Vec<FunnelStepResult>,
    /// Set when the report was degraded to empty after a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FunnelReport {
    fn empty(steps: &[StepMatcher], error: String) -> Self {
        Self {
            cohort_sessions: 0,
            steps: compute_step_results(steps, &vec![0; steps.len()], 0),
            error: Some(error),
        }
    }
}

/// Hash indexes over one page of cohort sessions.
struct ActivityIndex<'a> {
    by_page: HashMap<&'a str, HashSet<&'a str>>,
    by_event: HashMap<&'a str, HashSet<&'a str>>,
}

/// Sessions satisfying one matcher: borrowed straight from an equality index,
/// or built once for a substring matcher.
enum MatchSet<'i, 'a> {
    Indexed(Option<&'i HashSet<&'a str>>),
    Built(HashSet<&'a str>),
}

impl<'a> MatchSet<'_, 'a> {
    fn contains(&self, session_id: &str) -> bool {
        match self {
            MatchSet::Indexed(set) => set.is_some_and(|s| s.contains(session_id)),
            MatchSet::Built(set) => set.contains(session_id),
        }
    }

    fn to_set(&self) -> HashSet<&'a str> {
        match self {
            MatchSet::Indexed(set) => set.cloned().unwrap_or_default(),
            MatchSet::Built(set) => set.clone(),
        }
    }
}

impl<'a> ActivityIndex<'a> {
    fn build(page: &'a [SessionActivity]) -> Self {
        let mut by_page: HashMap<&str, HashSet<&str>> = HashMap::new();
        let mut by_event: HashMap<&str, HashSet<&str>> = HashMap::new();
        for session in page {
            for url in &session.pages {
                by_page.entry(url).or_default().insert(&session.session_id);
            }
            for name in &session.event_names {
                by_event.entry(name).or_default().insert(&session.session_id);
            }
        }
        Self { by_page, by_event }
    }

    fn matching(&self, matcher: &StepMatcher) -> MatchSet<'_, 'a> {
        match matcher {
            StepMatcher::PageMatch {
                path,
                operator: MatchOperator::Equals,
            } => MatchSet::Indexed(self.by_page.get(path.as_str())),
            StepMatcher::PageMatch {
                path,
                operator: MatchOperator::Contains,
            } => MatchSet::Built(
                self.by_page
                    .iter()
                    .filter(|(url, _)| url.contains(path.as_str()))
                    .flat_map(|(_, sessions)| sessions.iter().copied())
                    .collect(),
            ),
            StepMatcher::EventMatch { name } => {
                MatchSet::Indexed(self.by_event.get(name.as_str()))
            }
        }
    }
}

/// Per-step matched-session counts for one page of the cohort.
///
/// Step `i` keeps the sessions of step `i - 1` that also satisfy matcher `i`,
/// checked by hash lookup. Order of the actions inside a session is not
/// considered: a session that signed up and then viewed the pricing page
/// still reaches a `[pricing, signup]` funnel's second step.
pub fn count_steps(steps: &[StepMatcher], page: &[SessionActivity]) -> Vec<u64> {
    let index = ActivityIndex::build(page);
    let mut counts = Vec::with_capacity(steps.len());
    let mut current: HashSet<&str> = HashSet::new();

    for (idx, matcher) in steps.iter().enumerate() {
        let matching = index.matching(matcher);
        current = if idx == 0 {
            matching.to_set()
        } else {
            current
                .into_iter()
                .filter(|session| matching.contains(session))
                .collect()
        };
        counts.push(current.len() as u64);
    }
    counts
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Turn per-step counts into rates.
pub fn compute_step_results(
    steps: &[StepMatcher],
    counts: &[u64],
    cohort_sessions: u64,
) -> Vec<FunnelStepResult> {
    let first = counts.first().copied().unwrap_or(0);
    steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            let matched = counts.get(idx).copied().unwrap_or(0);
            let (conversion_rate, dropoff_rate) = if idx == 0 {
                (100.0, 0.0)
            } else {
                let previous = counts.get(idx - 1).copied().unwrap_or(0);
                (
                    percent(matched, first),
                    percent(previous.saturating_sub(matched), previous),
                )
            };
            FunnelStepResult {
                step_index: idx + 1,
                label: step.label(),
                matched_session_count: matched,
                conversion_rate,
                dropoff_rate,
                cohort_conversion_rate: percent(matched, cohort_sessions),
            }
        })
        .collect()
}

pub struct FunnelMatcher {
    store: Arc<dyn EventStore>,
    page_size: usize,
}

impl FunnelMatcher {
    pub fn new(store: Arc<dyn EventStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Evaluate `definition` over the sessions of `site_id` that started in `window`.
    ///
    /// The cohort is read page by page; a session's activity always arrives in
    /// one page, so per-page counts simply add up.
    pub async fn evaluate(
        &self,
        site_id: i64,
        definition: &FunnelDefinition,
        window: &CohortWindow,
    ) -> Result<FunnelReport, EngineError> {
        let steps = definition.steps();
        let mut totals = vec![0u64; steps.len()];
        let mut cohort_sessions = 0u64;
        let mut after: Option<String> = None;

        loop {
            let page = self
                .store
                .cohort_page(site_id, window, after.as_deref(), self.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            cohort_sessions += page.len() as u64;
            for (total, count) in totals.iter_mut().zip(count_steps(steps, &page)) {
                *total += count;
            }
            let full = page.len() >= self.page_size;
            after = page.last().map(|s| s.session_id.clone());
            if !full {
                break;
            }
        }

        debug!(site_id, cohort_sessions, steps = steps.len(), "funnel evaluated");
        Ok(FunnelReport {
            cohort_sessions,
            steps: compute_step_results(steps, &totals, cohort_sessions),
            error: None,
        })
    }

    /// Like [`evaluate`](Self::evaluate), but a failure yields an empty report
    /// carrying a generic message so one broken widget does not fail a dashboard.
    pub async fn evaluate_or_empty(
        &self,
        site_id: i64,
        definition: &FunnelDefinition,
        window: &CohortWindow,
    ) -> FunnelReport {
        match self.evaluate(site_id, definition, window).await {
            Ok(report) => report,
            Err(e) => {
                warn!(site_id, error = %e, "funnel evaluation failed; returning empty report");
                FunnelReport::empty(definition.steps(), e.public_message(Operation::Funnel))
            }
        }
    }
}
