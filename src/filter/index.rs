//! Multi-table rule index.
//!
//! One [`Filter`] indexes one loaded rule list. Rules are stored as byte
//! offsets into the source, never as objects: lookup produces candidate
//! offsets, and matching re-parses the line behind each candidate. This keeps
//! memory proportional to the rule count rather than the rule texts.
//!
//! Tables:
//!
//! - `domains`: 32-bit domain hash to offsets. Most adblock domains are
//!   unique, so the entry starts out as a bare offset and is only promoted to
//!   a list on the second insertion.
//! - `shortcuts`: hash of a fixed 5-byte slice of some literal pattern part.
//! - `leftovers`: linear list for rules with neither a usable domain nor a
//!   5-byte shortcut. Each entry has shortcuts, a compiled regex, or both.
//! - `badfilter`: hash of the rule text with the `badfilter` modifier
//!   stripped, so an annulling rule is found by the text of its victim.

use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, info, warn};

use super::matcher::{self, MatchContext};
use super::parser;
use super::rule::MatchMethod;
use super::source::{FilterParams, RuleSource};

/// Fixed length of an indexed shortcut slice.
pub const SHORTCUT_LENGTH: usize = 5;

// Empirical cost of one compiled regex.
const APPROX_COMPILED_REGEX_BYTES: usize = 1024;
// Rules outside the contiguous domain table fragment the heap; determined
// empirically.
const APPROX_FRAGMENTATION_COEF: f64 = 1.5;

/// FNV-1a, 32 bit. Table keys are these hashes; the rule text itself stays
/// in the source.
#[must_use]
pub fn hash32(data: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[derive(Debug)]
enum DomainEntry {
    Single(u32),
    Many(Vec<u32>),
}

struct LeftoverEntry {
    // each entry carries shortcuts, a regex, or both
    shortcuts: Vec<String>,
    regex: Option<Regex>,
    offset: u32,
}

/// Outcome of loading a rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    Ok,
    /// The memory budget ran out; the filter holds the rules loaded so far.
    MemLimitReached,
}

#[derive(Default)]
struct RuleStats {
    simple_domain_rules: usize,
    shortcut_rules: usize,
    leftover_rules: usize,
    badfilter_rules: usize,
}

/// An indexed rule list.
pub struct Filter {
    pub params: FilterParams,
    source: RuleSource,
    domains: HashMap<u32, DomainEntry>,
    shortcuts: HashMap<u32, Vec<u32>>,
    leftovers: Vec<LeftoverEntry>,
    badfilter: HashMap<u32, u32>,
    approx_mem: usize,
}

impl Filter {
    /// Load a rule list. `mem_limit` caps the approximate memory consumption
    /// in bytes; zero means unlimited. Returns the filter together with the
    /// load outcome and leaves rules beyond the budget unindexed.
    pub fn load(
        params: FilterParams,
        mem_limit: usize,
    ) -> std::io::Result<(Self, LoadResult)> {
        let source = RuleSource::open(&params)?;

        // first pass: classify and count so the tables can be pre-sized
        let mut stats = RuleStats::default();
        source.for_each_line(|_, line| {
            count_rule(line, &mut stats);
            true
        })?;

        let mut filter = Self {
            params,
            source,
            domains: HashMap::with_capacity(stats.simple_domain_rules),
            shortcuts: HashMap::with_capacity(stats.shortcut_rules),
            leftovers: Vec::with_capacity(stats.leftover_rules),
            badfilter: HashMap::with_capacity(stats.badfilter_rules),
            approx_mem: 0,
        };

        // second pass: insert each rule at its byte offset
        let mut result = LoadResult::Ok;
        {
            let Self {
                source,
                domains,
                shortcuts,
                leftovers,
                badfilter,
                approx_mem,
                ..
            } = &mut filter;
            source.for_each_line(|offset, line| {
                insert_line(
                    domains, shortcuts, leftovers, badfilter, approx_mem, mem_limit, offset,
                    line, &mut result,
                )
            })?;
        }

        info!(
            filter = filter.params.id,
            source = %filter.source.describe(),
            domains = filter.domains.len(),
            shortcuts = filter.shortcuts.len(),
            leftovers = filter.leftovers.len(),
            badfilter = filter.badfilter.len(),
            approx_mem_kb = filter.approx_mem / 1024 + 1,
            "loaded filter"
        );

        Ok((filter, result))
    }

    /// Approximate bytes consumed by the index.
    #[must_use]
    pub fn approx_mem(&self) -> usize {
        self.approx_mem
    }

    /// Whether the backing file changed since the filter was loaded.
    #[must_use]
    pub fn is_outdated(&self) -> bool {
        self.source.is_outdated()
    }

    /// Match the context against this filter's rules, appending matches to
    /// the accumulator and tagging them with the filter id.
    ///
    /// Returns `false` when the filter is outdated; the match is abandoned
    /// so the update coordinator can rebuild the filter.
    pub fn match_domain(&self, ctx: &mut MatchContext) -> bool {
        if self.is_outdated() {
            return false;
        }

        let first_new = ctx.matched_rules.len();

        self.search_by_domains(ctx);
        self.search_by_shortcuts(ctx);
        self.search_in_leftovers(ctx);
        self.search_badfilter_rules(ctx);

        for rule in &mut ctx.matched_rules[first_new..] {
            rule.filter_id = self.params.id;
        }
        true
    }

    fn search_by_domains(&self, ctx: &mut MatchContext) {
        for i in 0..ctx.subdomains.len() {
            let hash = hash32(&ctx.subdomains[i]);
            match self.domains.get(&hash) {
                Some(DomainEntry::Single(offset)) => self.try_offset(ctx, *offset),
                Some(DomainEntry::Many(offsets)) => {
                    for offset in offsets.clone() {
                        self.try_offset(ctx, offset);
                    }
                }
                None => {}
            }
        }
    }

    fn search_by_shortcuts(&self, ctx: &mut MatchContext) {
        if ctx.host.len() < SHORTCUT_LENGTH {
            return;
        }
        for i in 0..=ctx.host.len() - SHORTCUT_LENGTH {
            let Some(window) = ctx.host.get(i..i + SHORTCUT_LENGTH) else {
                continue; // window split a multi-byte character
            };
            if let Some(offsets) = self.shortcuts.get(&hash32(window)) {
                for offset in offsets.clone() {
                    self.try_offset(ctx, offset);
                }
            }
        }
    }

    fn search_in_leftovers(&self, ctx: &mut MatchContext) {
        for i in 0..self.leftovers.len() {
            let entry = &self.leftovers[i];
            if !entry.shortcuts.is_empty()
                && !matcher::match_shortcuts(&entry.shortcuts, &ctx.host)
            {
                continue;
            }
            match &entry.regex {
                Some(re) if !re.is_match(&ctx.host) => continue,
                _ => {}
            }
            self.try_offset(ctx, self.leftovers[i].offset);
        }
    }

    fn search_badfilter_rules(&self, ctx: &mut MatchContext) {
        let hashes: Vec<u32> = ctx
            .matched_rules
            .iter()
            .map(|rule| hash32(&rule.text))
            .collect();
        for hash in hashes {
            if let Some(offset) = self.badfilter.get(&hash) {
                self.try_offset(ctx, *offset);
            }
        }
    }

    fn try_offset(&self, ctx: &mut MatchContext, offset: u32) {
        let line = match self.source.line_at(offset) {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                warn!(
                    "failed to read rule source {}: {err}",
                    self.source.describe()
                );
                return;
            }
        };

        // the same rule can be reachable through several tables
        if ctx.matched_rules.iter().any(|rule| rule.text == line) {
            return;
        }

        matcher::match_against_line(ctx, &line);
    }
}

fn count_rule(line: &str, stats: &mut RuleStats) {
    let Some(rule) = parser::parse(line) else {
        return;
    };

    if rule.is_badfilter() {
        stats.badfilter_rules += 1;
        return;
    }

    match rule.match_method {
        MatchMethod::Exact | MatchMethod::Subdomains => {
            stats.simple_domain_rules += rule.matching_parts.len();
        }
        MatchMethod::Shortcuts | MatchMethod::ShortcutsAndRegex => stats.shortcut_rules += 1,
        MatchMethod::Regex => stats.leftover_rules += 1,
    }
}

fn put_domain(domains: &mut HashMap<u32, DomainEntry>, hash: u32, offset: u32) {
    match domains.entry(hash) {
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(DomainEntry::Single(offset));
        }
        std::collections::hash_map::Entry::Occupied(mut slot) => match slot.get_mut() {
            DomainEntry::Single(existing) => {
                let existing = *existing;
                slot.insert(DomainEntry::Many(vec![existing, offset]));
            }
            DomainEntry::Many(offsets) => offsets.push(offset),
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_line(
    domains: &mut HashMap<u32, DomainEntry>,
    shortcuts: &mut HashMap<u32, Vec<u32>>,
    leftovers: &mut Vec<LeftoverEntry>,
    badfilter: &mut HashMap<u32, u32>,
    approx_mem: &mut usize,
    mem_limit: usize,
    offset: u32,
    line: &str,
    result: &mut LoadResult,
) -> bool {
    let Some(rule) = parser::parse(line) else {
        if !line.is_empty() && !parser::is_comment(line) {
            debug!("failed to parse rule: {line}");
        }
        return true;
    };

    let over_budget = |mem: &usize, rule_mem: usize| {
        mem_limit != 0 && mem_limit < *mem + rule_mem
    };

    if rule.is_badfilter() {
        let text = parser::text_without_badfilter(&rule.text);
        // (key + value) times an empty-bucket coefficient
        let rule_mem = 4 * std::mem::size_of::<u32>();
        if over_budget(approx_mem, rule_mem) {
            *result = LoadResult::MemLimitReached;
            return false;
        }
        badfilter.insert(hash32(&text), offset);
        *approx_mem += rule_mem;
        *result = LoadResult::Ok;
        return true;
    }

    let rule_mem = match rule.match_method {
        MatchMethod::Exact | MatchMethod::Subdomains => {
            // assume non-unique domains are rare
            let rule_mem = rule.matching_parts.len() * 4 * std::mem::size_of::<u32>();
            if over_budget(approx_mem, rule_mem) {
                *result = LoadResult::MemLimitReached;
                return false;
            }
            for part in &rule.matching_parts {
                put_domain(domains, hash32(part), offset);
            }
            rule_mem
        }
        method @ (MatchMethod::Shortcuts
        | MatchMethod::ShortcutsAndRegex
        | MatchMethod::Regex) => {
            let shortcut = (method != MatchMethod::Regex)
                .then(|| {
                    rule.matching_parts.iter().find(|part| {
                        part.len() >= SHORTCUT_LENGTH && part.is_char_boundary(SHORTCUT_LENGTH)
                    })
                })
                .flatten();

            if let Some(shortcut) = shortcut {
                let bucket_base = 2 * (std::mem::size_of::<u32>() + std::mem::size_of::<Vec<u32>>());
                let hash = hash32(&shortcut[..SHORTCUT_LENGTH]);
                let is_new = !shortcuts.contains_key(&hash);
                let raw = if is_new { bucket_base } else { 0 } + std::mem::size_of::<u32>();
                let rule_mem = (raw as f64 * APPROX_FRAGMENTATION_COEF) as usize;
                if over_budget(approx_mem, rule_mem) {
                    *result = LoadResult::MemLimitReached;
                    return false;
                }
                shortcuts.entry(hash).or_default().push(offset);
                rule_mem
            } else {
                // no 5-byte shortcut: fall through to the leftovers table
                let regex = if method == MatchMethod::Shortcuts {
                    None
                } else {
                    match Regex::new(&parser::get_regex(&rule.text)) {
                        Ok(re) => Some(re),
                        Err(err) => {
                            debug!("dropping rule with invalid regex {line:?}: {err}");
                            return true;
                        }
                    }
                };
                debug_assert!(!rule.matching_parts.is_empty() || regex.is_some());

                let mut raw = std::mem::size_of::<LeftoverEntry>();
                raw += rule.matching_parts.iter().map(String::len).sum::<usize>();
                if regex.is_some() {
                    raw += APPROX_COMPILED_REGEX_BYTES;
                }
                let rule_mem = (raw as f64 * APPROX_FRAGMENTATION_COEF) as usize;
                if over_budget(approx_mem, rule_mem) {
                    *result = LoadResult::MemLimitReached;
                    return false;
                }
                leftovers.push(LeftoverEntry {
                    shortcuts: rule.matching_parts,
                    regex,
                    offset,
                });
                rule_mem
            }
        }
    };

    *approx_mem += rule_mem;
    *result = LoadResult::Ok;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::RecordType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load_memory(rules: &str) -> Filter {
        let (filter, result) = Filter::load(FilterParams::in_memory(1, rules), 0).unwrap();
        assert_eq!(result, LoadResult::Ok);
        filter
    }

    fn match_host(filter: &Filter, host: &str, rr_type: RecordType) -> Vec<String> {
        let mut ctx = MatchContext::new(host, rr_type);
        assert!(filter.match_domain(&mut ctx));
        ctx.matched_rules.into_iter().map(|r| r.text).collect()
    }

    #[test]
    fn should_find_domain_rule_through_unique_table() {
        let filter = load_memory("||example.org^\n||other.example^\n");
        assert_eq!(
            match_host(&filter, "sub.example.org", RecordType::A),
            vec!["||example.org^"]
        );
    }

    #[test]
    fn should_promote_duplicate_domain_hashes() {
        let filter = load_memory("||example.org^\n||example.org^$important\n");
        let matched = match_host(&filter, "example.org", RecordType::A);
        assert_eq!(matched.len(), 2);
        assert!(matched.contains(&"||example.org^".to_string()));
        assert!(matched.contains(&"||example.org^$important".to_string()));
    }

    #[test]
    fn should_find_rule_through_shortcut_table() {
        let filter = load_memory("exampl*ads\n");
        assert_eq!(
            match_host(&filter, "exampletrackingads", RecordType::A),
            vec!["exampl*ads"]
        );
        assert!(match_host(&filter, "example.org", RecordType::A).is_empty());
    }

    #[test]
    fn should_find_regex_rule_through_leftovers() {
        let filter = load_memory("/^ad[0-9]$/\n");
        assert_eq!(match_host(&filter, "ad1", RecordType::A), vec!["/^ad[0-9]$/"]);
        assert!(match_host(&filter, "ads", RecordType::A).is_empty());
    }

    #[test]
    fn should_find_badfilter_annuller_for_matched_rule() {
        let filter = load_memory("||example.org^\n||example.org^$badfilter\n");
        let matched = match_host(&filter, "example.org", RecordType::A);
        assert_eq!(matched.len(), 2);
        assert!(matched.contains(&"||example.org^$badfilter".to_string()));
    }

    #[test]
    fn should_suppress_duplicate_candidates() {
        // reachable through both the domain hash of each part
        let filter = load_memory("0.0.0.0 same.example.org same.example.org\n");
        let matched = match_host(&filter, "same.example.org", RecordType::A);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn should_match_case_insensitively() {
        let filter = load_memory("||EXAMPLE.org^\n");
        assert_eq!(
            match_host(&filter, "ExAmPlE.ORG", RecordType::A).len(),
            1
        );
    }

    #[test]
    fn should_skip_unparsable_lines_and_keep_loading() {
        let filter = load_memory("||bad rule with spaces^\n||good.example^\n");
        assert_eq!(match_host(&filter, "good.example", RecordType::A).len(), 1);
    }

    #[test]
    fn should_stop_loading_at_memory_limit() {
        let mut rules = String::new();
        for i in 0..1000 {
            rules.push_str(&format!("||domain{i}.example.org^\n"));
        }
        let (filter, result) = Filter::load(FilterParams::in_memory(1, &rules), 64).unwrap();
        assert_eq!(result, LoadResult::MemLimitReached);
        assert!(filter.approx_mem() <= 64);
        // the first few rules still made it in
        assert_eq!(
            match_host(&filter, "domain0.example.org", RecordType::A).len(),
            1
        );
    }

    #[test]
    fn should_report_outdated_file_and_abandon_match() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "||example.org^").unwrap();
        file.flush().unwrap();

        let params = FilterParams::from_file(7, file.path().to_string_lossy());
        let (filter, _) = Filter::load(params, 0).unwrap();
        assert_eq!(match_host(&filter, "example.org", RecordType::A).len(), 1);

        let handle = std::fs::File::options()
            .write(true)
            .open(file.path())
            .unwrap();
        handle
            .set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(5))
            .unwrap();

        let mut ctx = MatchContext::new("example.org", RecordType::A);
        assert!(!filter.match_domain(&mut ctx));
        assert!(ctx.matched_rules.is_empty());
    }

    #[test]
    fn should_tag_matches_with_filter_id() {
        let (filter, _) =
            Filter::load(FilterParams::in_memory(-3, "||example.org^\n"), 0).unwrap();
        let mut ctx = MatchContext::new("example.org", RecordType::A);
        filter.match_domain(&mut ctx);
        assert_eq!(ctx.matched_rules[0].filter_id, -3);
    }

    #[test]
    fn should_hash_deterministically() {
        assert_eq!(hash32("example.org"), hash32("example.org"));
        assert_ne!(hash32("example.org"), hash32("example.com"));
    }
}
