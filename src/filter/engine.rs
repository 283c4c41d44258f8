//! Engine over all loaded filter lists.
//!
//! Filters are built once and then read-only; the update coordinator replaces
//! an outdated filter wholesale, returning its memory to the shared budget
//! before re-loading under the restored budget.

use std::sync::atomic::{AtomicUsize, Ordering};

use hickory_proto::rr::RecordType;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use super::index::{Filter, LoadResult};
use super::matcher::MatchContext;
use super::source::FilterParams;

/// Result of matching one domain across every loaded filter.
pub struct EngineMatch {
    pub context: MatchContext,
    /// Ids of filters whose backing file changed on disk; their rules did not
    /// participate in this match.
    pub outdated: Vec<i32>,
}

/// The rule engine: every loaded filter plus the shared memory budget.
pub struct Engine {
    filters: RwLock<Vec<Filter>>,
    /// Remaining budget in bytes; `usize::MAX` when unlimited.
    budget: AtomicUsize,
}

impl Engine {
    /// Load every filter list. Load failures and partial loads are warnings,
    /// never fatal: the engine starts with whatever could be indexed.
    ///
    /// Returns the engine and an optional warning message.
    pub fn new(params: Vec<FilterParams>, mem_limit: usize) -> (Self, Option<String>) {
        let budget = AtomicUsize::new(if mem_limit == 0 { usize::MAX } else { mem_limit });
        let mut filters = Vec::with_capacity(params.len());
        let mut warning = None;

        for param in params {
            let id = param.id;
            let remaining = budget.load(Ordering::Relaxed);
            let limit = if remaining == usize::MAX { 0 } else { remaining };
            match Filter::load(param, limit) {
                Ok((filter, result)) => {
                    if remaining != usize::MAX {
                        budget.fetch_sub(filter.approx_mem().min(remaining), Ordering::Relaxed);
                    }
                    if result == LoadResult::MemLimitReached {
                        warn!(filter = id, "filter loaded partially: memory limit reached");
                        warning = Some("memory limit reached".to_string());
                    }
                    filters.push(filter);
                }
                Err(err) => {
                    error!(filter = id, "failed to load filter: {err}");
                    warning.get_or_insert_with(|| format!("failed to load filter {id}: {err}"));
                }
            }
        }

        (
            Self {
                filters: RwLock::new(filters),
                budget,
            },
            warning,
        )
    }

    /// An engine with no filters; every match comes back empty.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            filters: RwLock::new(Vec::new()),
            budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Match a domain against every filter, in configuration order.
    pub fn match_domain(&self, domain: &str, rr_type: RecordType) -> EngineMatch {
        let mut context = MatchContext::new(domain, rr_type);
        let mut outdated = Vec::new();

        let filters = self.filters.read();
        for filter in filters.iter() {
            if !filter.match_domain(&mut context) {
                outdated.push(filter.params.id);
            }
        }

        EngineMatch { context, outdated }
    }

    /// True when some filter matches the domain at all. Used for the
    /// fallback-domain filter where only the yes/no answer matters.
    #[must_use]
    pub fn matches(&self, domain: &str, rr_type: RecordType) -> bool {
        !self.match_domain(domain, rr_type).context.matched_rules.is_empty()
    }

    /// Number of loaded filters.
    #[must_use]
    pub fn filter_count(&self) -> usize {
        self.filters.read().len()
    }

    /// Rebuild every filter whose backing file changed. Memory of the old
    /// index is released to the budget before the reload; a partial rebuild
    /// is reported but kept.
    ///
    /// Returns the number of filters rebuilt.
    pub fn refresh_outdated(&self) -> usize {
        let outdated: Vec<(usize, FilterParams, usize)> = {
            let filters = self.filters.read();
            filters
                .iter()
                .enumerate()
                .filter(|(_, f)| f.is_outdated())
                .map(|(i, f)| (i, f.params.clone(), f.approx_mem()))
                .collect()
        };

        let mut rebuilt = 0;
        for (index, params, old_mem) in outdated {
            let id = params.id;
            info!(filter = id, "updating filter");

            let unlimited = self.budget.load(Ordering::Relaxed) == usize::MAX;
            if !unlimited {
                self.budget.fetch_add(old_mem, Ordering::Relaxed);
            }
            let remaining = self.budget.load(Ordering::Relaxed);
            let limit = if unlimited { 0 } else { remaining };

            match Filter::load(params, limit) {
                Ok((filter, result)) => {
                    if !unlimited {
                        self.budget
                            .fetch_sub(filter.approx_mem().min(remaining), Ordering::Relaxed);
                    }
                    if result == LoadResult::MemLimitReached {
                        warn!(filter = id, "filter updated partially: memory limit reached");
                    }
                    let mut filters = self.filters.write();
                    if let Some(slot) = filters.get_mut(index) {
                        *slot = filter;
                        rebuilt += 1;
                    }
                    info!(filter = id, "filter update successful");
                }
                Err(err) => {
                    // charge the old index back, it stays in place
                    if !unlimited {
                        self.budget.fetch_sub(old_mem.min(remaining), Ordering::Relaxed);
                    }
                    error!(filter = id, "filter was not updated: {err}");
                }
            }
        }
        rebuilt
    }
}
