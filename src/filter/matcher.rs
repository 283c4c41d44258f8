//! Rule evaluation against a single query.
//!
//! The index narrows a query down to candidate source lines; this module
//! re-parses each candidate, applies modifier gates, evaluates the pattern
//! and finally picks the effective rules out of everything that matched.

use hickory_proto::rr::RecordType;
use regex::Regex;
use tracing::debug;

use super::parser;
use super::rule::{MatchMethod, RewriteValue, Rule, RuleBody, RuleProps};

const REVERSE_DNS_SUFFIX: &str = ".in-addr.arpa";
const REVERSE_IPV6_DNS_SUFFIX: &str = ".ip6.arpa";

/// Per-query state threaded through every filter.
#[derive(Debug)]
pub struct MatchContext {
    /// Lowercased question name without the trailing dot.
    pub host: String,
    /// The host plus every proper parent above the TLD, in order.
    pub subdomains: Vec<String>,
    pub rr_type: RecordType,
    /// Accumulator of matched rules, in discovery order.
    pub matched_rules: Vec<Rule>,
    /// Set for PTR queries under the reverse-DNS zones.
    pub reverse_lookup_fqdn: Option<String>,
}

impl MatchContext {
    #[must_use]
    pub fn new(domain: &str, rr_type: RecordType) -> Self {
        let host = domain.trim_end_matches('.').to_lowercase();

        let dots = host.matches('.').count();
        let levels = if dots > 0 { dots } else { 1 }; // all except the TLD
        let mut subdomains = Vec::with_capacity(levels);
        subdomains.push(host.clone());
        let mut rest = host.as_str();
        for _ in 1..levels {
            rest = &rest[rest.find('.').map_or(rest.len(), |p| p + 1)..];
            subdomains.push(rest.to_string());
        }

        let reverse_lookup_fqdn = (rr_type == RecordType::PTR
            && (host.ends_with(REVERSE_DNS_SUFFIX) || host.ends_with(REVERSE_IPV6_DNS_SUFFIX)))
        .then(|| format!("{host}."));

        Self {
            host,
            subdomains,
            rr_type,
            matched_rules: Vec::new(),
            reverse_lookup_fqdn,
        }
    }
}

enum ModifierMatch {
    /// Rejected by its modifiers.
    NotMatched,
    /// Modifiers pass; the pattern still has to match.
    Candidate,
    /// Matched by modifiers alone, pattern check not needed.
    MatchedSurely,
}

fn match_adblock_modifiers(rule: &Rule, ctx: &MatchContext) -> ModifierMatch {
    if rule.is_badfilter() {
        // a $badfilter rule is a marker; its effect is applied during selection
        return ModifierMatch::MatchedSurely;
    }

    if rule.props.contains(RuleProps::DNSTYPE) {
        let Some(constraint) = rule.dnstype() else {
            return ModifierMatch::NotMatched;
        };
        return if constraint.allows(ctx.rr_type) {
            ModifierMatch::Candidate
        } else {
            ModifierMatch::NotMatched
        };
    }

    if rule.props.contains(RuleProps::DNSREWRITE) {
        if let Some(value) = rule.rewrite().and_then(|r| r.value.as_ref()) {
            let rejected = match value {
                RewriteValue::A(_) => ctx.rr_type != RecordType::A,
                RewriteValue::Aaaa(_) => ctx.rr_type != RecordType::AAAA,
                RewriteValue::Ptr(_) => ctx.rr_type != RecordType::PTR,
                RewriteValue::Cname(_) => {
                    ctx.rr_type != RecordType::A && ctx.rr_type != RecordType::AAAA
                }
                RewriteValue::Mx(..) | RewriteValue::Txt(_) => false,
            };
            if rejected {
                return ModifierMatch::NotMatched;
            }
        }
    }

    ModifierMatch::Candidate
}

/// Whether every shortcut occurs in `host` in order, each search starting
/// where the previous match ended.
#[must_use]
pub fn match_shortcuts(shortcuts: &[String], host: &str) -> bool {
    let mut seek = 0;
    for sc in shortcuts {
        match host[seek..].find(sc.as_str()) {
            Some(pos) => seek += pos + sc.len(),
            None => return false,
        }
    }
    true
}

fn equals_part(part: &str, candidate: &str, ctx: &MatchContext) -> bool {
    part == candidate
        || ctx
            .reverse_lookup_fqdn
            .as_deref()
            .is_some_and(|fqdn| part == fqdn)
}

fn match_pattern(rule: &Rule, ctx: &MatchContext) -> bool {
    match rule.match_method {
        MatchMethod::Exact => rule
            .matching_parts
            .iter()
            .any(|part| equals_part(part, &ctx.host, ctx)),
        MatchMethod::Subdomains => rule.matching_parts.iter().any(|part| {
            ctx.subdomains
                .iter()
                .any(|subdomain| equals_part(part, subdomain, ctx))
        }),
        MatchMethod::Shortcuts => match_shortcuts(&rule.matching_parts, &ctx.host),
        MatchMethod::ShortcutsAndRegex => {
            match_shortcuts(&rule.matching_parts, &ctx.host)
                && compile_rule_regex(rule)
                    .is_some_and(|re| re.is_match(&ctx.host))
        }
        MatchMethod::Regex => compile_rule_regex(rule).is_some_and(|re| {
            ctx.subdomains
                .iter()
                .any(|subdomain| re.is_match(subdomain))
        }),
    }
}

fn compile_rule_regex(rule: &Rule) -> Option<Regex> {
    let source = parser::get_regex(&rule.text);
    match Regex::new(&source) {
        Ok(re) => Some(re),
        Err(err) => {
            debug!("failed to compile rule regex {source:?}: {err}");
            None
        }
    }
}

/// Evaluate a candidate source line against the context; a match is appended
/// to the accumulator. Returns whether the line matched.
pub fn match_against_line(ctx: &mut MatchContext, line: &str) -> bool {
    let Some(rule) = parser::parse(line) else {
        return false;
    };

    if matches!(rule.body, RuleBody::Adblock { .. }) {
        match match_adblock_modifiers(&rule, ctx) {
            ModifierMatch::NotMatched => return false,
            ModifierMatch::MatchedSurely => {
                debug!("'{}' matched rule '{line}'", ctx.host);
                ctx.matched_rules.push(rule);
                return true;
            }
            ModifierMatch::Candidate => {}
        }
    }

    if match_pattern(&rule, ctx) {
        debug!("'{}' matched rule '{line}'", ctx.host);
        ctx.matched_rules.push(rule);
        return true;
    }
    false
}

fn precedence(rule: &Rule) -> u8 {
    match (rule.is_important(), rule.is_exception()) {
        (true, true) => 3,
        (true, false) => 2,
        (false, true) => 1,
        (false, false) => 0,
    }
}

fn family_compatible(rule: &Rule, rr_type: RecordType) -> bool {
    match &rule.body {
        RuleBody::Hosts { ip } => match rr_type {
            RecordType::A => ip.is_ipv4(),
            RecordType::AAAA => ip.is_ipv6(),
            _ => true,
        },
        RuleBody::Adblock { .. } => true,
    }
}

/// Choose the rules that decide the query's fate.
///
/// Rules annulled by a `$badfilter` twin are discarded first. If any
/// non-exception `$dnsrewrite` rules survive (an `@@` rewrite cancels the
/// blocking rewrite with the same text), all surviving rewrite rules are
/// effective together. Otherwise a single rule wins by the precedence
/// ladder important-exception > important > exception > block; within a tier
/// the last-matched rule shadows earlier ones, and hosts rules whose address
/// family fits the query are preferred over ones that do not.
#[must_use]
pub fn effective_rules(matched: &[Rule], rr_type: RecordType) -> Vec<Rule> {
    let annulled: Vec<String> = matched
        .iter()
        .filter(|r| r.is_badfilter())
        .map(|r| parser::text_without_badfilter(&r.text))
        .collect();

    let alive: Vec<&Rule> = matched
        .iter()
        .filter(|r| !r.is_badfilter() && !annulled.iter().any(|text| *text == r.text))
        .collect();

    let rewrites: Vec<&Rule> = alive
        .iter()
        .copied()
        .filter(|r| r.props.contains(RuleProps::DNSREWRITE))
        .collect();
    if !rewrites.is_empty() {
        let cancelled: Vec<&str> = rewrites
            .iter()
            .filter(|r| r.is_exception())
            .map(|r| r.text.strip_prefix("@@").unwrap_or(&r.text))
            .collect();
        let surviving: Vec<Rule> = rewrites
            .iter()
            .filter(|r| r.is_exception() || !cancelled.contains(&r.text.as_str()))
            .map(|r| (*r).clone())
            .collect();
        if surviving.iter().any(|r| !r.is_exception()) {
            return surviving;
        }
        // every rewrite got cancelled, fall through to plain selection
    }

    let plain: Vec<&Rule> = alive
        .iter()
        .copied()
        .filter(|r| !r.props.contains(RuleProps::DNSREWRITE))
        .collect();
    let Some(top) = plain.iter().map(|r| precedence(r)).max() else {
        return Vec::new();
    };

    let tier: Vec<&Rule> = plain
        .iter()
        .copied()
        .filter(|r| precedence(r) == top)
        .collect();
    tier.iter()
        .rev()
        .find(|r| family_compatible(r, rr_type))
        .copied()
        .or_else(|| tier.last().copied())
        .cloned()
        .into_iter()
        .collect()
}
