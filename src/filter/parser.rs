//! Rule line parser.
//!
//! Classifies one logical line of a rule list and produces a typed [`Rule`].
//!
//! # Classification order
//!
//! 1. Comment lines (`!` or `#`, or blank) produce nothing.
//! 2. A bare domain name becomes an exact-match adblock rule.
//! 3. An IP literal followed by domain tokens becomes a hosts rule.
//! 4. Everything else is parsed as adblock syntax:
//!    `[@@]pattern[$modifier[,modifier]...]` where the pattern is bare,
//!    `||`-anchored, `|`-anchored, or `/regex/`.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, RecordType};
use regex::Regex;
use tracing::debug;

use super::rule::{
    DnsRewrite, DnsTypeConstraint, DnsTypeMode, MatchMethod, RewriteValue, Rule, RuleBody,
    RuleProps,
};

const MODIFIERS_MARKER: char = '$';
const MODIFIERS_DELIMITER: char = ',';
const EXCEPTION_MARKER: &str = "@@";
const BADFILTER_MODIFIER: &str = "badfilter";

const SKIPPABLE_PREFIXES: [&str; 8] = [
    "https://", "http://", "http*://", "ws://", "wss://", "ws*://", "://", "//",
];
const SPECIAL_SUFFIXES: [&str; 3] = ["|", "^", "/"];
const SPECIAL_REGEX_CHARACTERS: &str = "\\^$*+?.()|[]{}";

// RFC 1035 §2.3.4 size limits
const MAX_DOMAIN_LENGTH: usize = 255;
// RFC 1034 §3.5 preferred name syntax
const MAX_LABEL_LENGTH: usize = 63;
// INET6_ADDRSTRLEN - 1
const MAX_IPADDR_LENGTH: usize = 45;

/// Pattern anchor assertions collected while stripping the pattern body.
mod pattern_mode {
    pub const DOMAIN_START: u8 = 1 << 0;
    pub const LINE_START: u8 = 1 << 1;
    pub const LINE_END: u8 = 1 << 2;
}

/// What remains of an adblock pattern after anchors and noise are stripped.
#[derive(Debug, Clone, Copy)]
struct MatchInfo<'a> {
    text: &'a str,
    is_regex_rule: bool,
    has_wildcard: bool,
    mode: u8,
}

/// Returns true for `!` and `#` comment lines.
#[must_use]
pub fn is_comment(line: &str) -> bool {
    line.starts_with('!') || line.starts_with('#')
}

/// Parse one line of a rule list. Returns `None` for comments, blank lines
/// and anything that fails to parse; parse failures are logged at debug level.
#[must_use]
pub fn parse(line: &str) -> Option<Rule> {
    if is_comment(line) {
        return None;
    }

    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if is_domain_name(line) {
        return Some(make_exact_domain_rule(line));
    }

    if is_host_rule(line) {
        return parse_host_file_rule(line);
    }

    parse_adblock_rule(line)
}

fn check_domain_pattern_labels(domain: &str) -> bool {
    domain.split('.').all(|label| label.len() <= MAX_LABEL_LENGTH)
}

fn check_domain_pattern_charset(domain: &str) -> bool {
    // RFC 1034 §3.5 charset, plus '*' for light-weight wildcards and '_'
    // because real-world lists use it
    domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '*' | '_'))
}

fn is_valid_domain_pattern(domain: &str) -> bool {
    domain.len() <= MAX_DOMAIN_LENGTH
        && check_domain_pattern_charset(domain)
        && check_domain_pattern_labels(domain)
}

fn is_valid_ip_pattern(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_IPADDR_LENGTH {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_hexdigit() || matches!(c, '.' | ':' | '[' | ']' | '*'))
}

fn is_ip(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// Whether `s` is a plain domain name (as opposed to a pattern).
#[must_use]
pub fn is_domain_name(s: &str) -> bool {
    !s.is_empty()
        && !is_ip(s)
        && !s.ends_with('.') // a trailing dot makes it a pattern
        && !s.starts_with('.')
        && is_valid_domain_pattern(s)
        && !s.contains('*')
}

fn make_exact_domain_rule(name: &str) -> Rule {
    Rule {
        text: name.to_string(),
        filter_id: 0,
        props: RuleProps::default(),
        match_method: MatchMethod::Exact,
        matching_parts: vec![name.to_lowercase()],
        body: RuleBody::Adblock {
            dnstype: None,
            rewrite: None,
        },
    }
}

fn is_host_rule(s: &str) -> bool {
    let mut parts = s.split_whitespace();
    matches!(parts.next(), Some(first) if first.parse::<IpAddr>().is_ok())
        && parts.next().is_some()
}

fn parse_host_file_rule(line: &str) -> Option<Rule> {
    let line = line.split('#').next().unwrap_or(line).trim_end();
    let mut parts = line.split_whitespace();
    let ip: IpAddr = parts.next()?.parse().ok()?;

    let mut matching_parts = Vec::new();
    for domain in parts {
        if !is_valid_domain_pattern(domain) && !domain.contains('*') {
            return None;
        }
        matching_parts.push(domain.to_lowercase());
    }
    if matching_parts.is_empty() {
        return None;
    }

    Some(Rule {
        text: line.to_string(),
        filter_id: 0,
        props: RuleProps::default(),
        match_method: MatchMethod::Subdomains,
        matching_parts,
        body: RuleBody::Hosts { ip },
    })
}

fn check_regex(s: &str) -> bool {
    s.len() > 1 && s.starts_with('/') && s.ends_with('/')
}

/// Splits `s` at the last occurrence of `marker` into (head, tail).
/// The tail is empty when the marker is absent.
fn rsplit2(s: &str, marker: char) -> (&str, &str) {
    match s.rfind(marker) {
        Some(pos) => (&s[..pos], &s[pos + 1..]),
        None => (s, ""),
    }
}

fn remove_skippable_prefixes(rule: &mut &str) -> u8 {
    for prefix in SKIPPABLE_PREFIXES {
        if let Some(rest) = rule.strip_prefix(prefix) {
            *rule = rest;
            return pattern_mode::DOMAIN_START;
        }
    }
    0
}

fn remove_special_prefixes(rule: &mut &str) -> u8 {
    if let Some(rest) = rule.strip_prefix("||") {
        *rule = rest;
        return pattern_mode::DOMAIN_START;
    }
    if let Some(rest) = rule.strip_prefix('|') {
        *rule = rest;
        return pattern_mode::LINE_START;
    }
    0
}

fn remove_special_suffixes(rule: &mut &str) -> u8 {
    let mut mode = 0;
    let mut candidates: Vec<&str> = SPECIAL_SUFFIXES.to_vec();
    loop {
        let Some(pos) = candidates
            .iter()
            .position(|suffix| rule.ends_with(suffix))
        else {
            return mode;
        };
        *rule = &rule[..rule.len() - candidates[pos].len()];
        mode = pattern_mode::LINE_END;
        candidates.remove(pos);
    }
}

fn is_valid_port(p: &str) -> bool {
    !p.is_empty() && p.len() <= 5 && p.chars().all(|c| c.is_ascii_digit())
}

fn remove_port(rule: &mut &str) -> u8 {
    let Some(rpos) = rule.rfind(':') else {
        return 0;
    };
    let fpos = rule.find(':').unwrap();
    if fpos == rpos && fpos != rule.len() - 1 && is_valid_port(&rule[fpos + 1..]) {
        *rule = &rule[..fpos];
        return pattern_mode::LINE_END;
    }
    if fpos > 0 && rule.as_bytes()[fpos - 1] == b']' && rule.starts_with('[') {
        *rule = &rule[1..rpos - 1];
        return pattern_mode::LINE_START | pattern_mode::LINE_END;
    }
    0
}

fn extract_match_info(rule: &str) -> MatchInfo<'_> {
    let mut info = MatchInfo {
        text: rule,
        is_regex_rule: check_regex(rule),
        has_wildcard: false,
        mode: 0,
    };

    if info.is_regex_rule {
        info.text = &rule[1..rule.len() - 1];
        return info;
    }

    // special prefixes come before skippable ones (e.g. `||http://example.org`)
    let mut text = rule;
    info.mode |= remove_special_prefixes(&mut text);
    info.mode |= remove_skippable_prefixes(&mut text);
    if info.mode & pattern_mode::DOMAIN_START != 0 && info.mode & pattern_mode::LINE_START != 0 {
        info.mode ^= pattern_mode::DOMAIN_START;
    }

    info.mode |= remove_special_suffixes(&mut text);
    info.mode |= remove_port(&mut text);

    info.text = text;
    info.has_wildcard = text.contains('*');
    info
}

static SHORTCUT_SANITIZERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // strip all types of brackets
        r"([^\\]*)\([^\\]*\)",
        r"([^\\]*)\{[^\\]*\}",
        r"([^\\]*)\[[^\\]*\]",
        // strip escaped characters
        r"([^\\]*)\\[a-zA-Z]",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static pattern"))
    .collect()
});

fn skip_special_chars(s: &str) -> &str {
    if s.is_empty() {
        return s;
    }

    const SPEC_SEQS: [&str; 15] = [
        // escape sequences
        "\\n", "\\r", "\\t", // metacharacters
        "\\d", "\\D", "\\w", "\\W", "\\s", "\\S", // position anchors
        "\\b", "\\B", "\\<", "\\>", "\\A", "\\Z",
    ];

    let skip = SPEC_SEQS
        .iter()
        .find(|seq| s.starts_with(**seq))
        .map_or(1, |seq| seq.len());
    &s[skip..]
}

fn extract_regex_shortcuts(text: &str) -> Vec<String> {
    let mut shortcuts = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let seek = rest
            .find(|c| SPECIAL_REGEX_CHARACTERS.contains(c))
            .unwrap_or(rest.len());
        if seek > 0 {
            shortcuts.push(rest[..seek].to_string());
        }
        rest = skip_special_chars(&rest[seek..]);
    }
    shortcuts
}

/// Synthesize the regex equivalent of a non-regex pattern, or return the
/// regex body verbatim. Only meaningful for `Regex`/`ShortcutsAndRegex` rules.
#[must_use]
pub fn get_regex(rule_text: &str) -> String {
    let mut text = rule_text.strip_prefix(EXCEPTION_MARKER).unwrap_or(rule_text);

    if !check_regex(text) {
        (text, _) = rsplit2(text, MODIFIERS_MARKER);
    }

    let info = extract_match_info(text);
    if info.is_regex_rule {
        return info.text.to_string();
    }

    let prefix = if info.mode & pattern_mode::LINE_START != 0 {
        "^"
    } else if info.mode & pattern_mode::DOMAIN_START != 0 {
        "^(*.)?"
    } else {
        ""
    };
    let suffix = if info.mode & pattern_mode::LINE_END != 0 {
        "$"
    } else {
        ""
    };

    let raw = format!("{prefix}{}{suffix}", info.text);
    let mut re = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '*' => re.push('.'),
            '.' => re.push('\\'),
            _ => {}
        }
        re.push(ch);
    }
    re
}

/// The rule text with the `badfilter` modifier token removed and any orphan
/// `,` or `$` cleaned up. A badfilter rule annuls the rule with this text.
#[must_use]
pub fn text_without_badfilter(text: &str) -> String {
    let (body, modifiers) = rsplit2(text, MODIFIERS_MARKER);
    let Some(bf_pos) = modifiers.find(BADFILTER_MODIFIER) else {
        return text.to_string();
    };

    let mut prefix = &text[..body.len() + 1 + bf_pos];
    let mut suffix = &modifiers[bf_pos + BADFILTER_MODIFIER.len()..];
    if prefix.ends_with(',') || (suffix.is_empty() && prefix.ends_with(MODIFIERS_MARKER)) {
        prefix = &prefix[..prefix.len() - 1];
    } else if suffix.starts_with(MODIFIERS_DELIMITER) && prefix.ends_with(MODIFIERS_MARKER) {
        suffix = &suffix[1..];
    }

    format!("{prefix}{suffix}")
}

fn parse_rcode(s: &str) -> Option<ResponseCode> {
    match s {
        "NOERROR" => Some(ResponseCode::NoError),
        "NXDOMAIN" => Some(ResponseCode::NXDomain),
        "REFUSED" => Some(ResponseCode::Refused),
        "SERVFAIL" => Some(ResponseCode::ServFail),
        _ => None,
    }
}

fn parse_rewrite_shorthand(value: &str) -> Option<DnsRewrite> {
    if let Ok(v4) = value.parse() {
        return Some(DnsRewrite {
            rcode: ResponseCode::NoError,
            value: Some(RewriteValue::A(v4)),
        });
    }
    if let Ok(v6) = value.parse() {
        return Some(DnsRewrite {
            rcode: ResponseCode::NoError,
            value: Some(RewriteValue::Aaaa(v6)),
        });
    }
    if let Some(rcode) = parse_rcode(value) {
        return Some(DnsRewrite { rcode, value: None });
    }
    if is_domain_name(value) {
        let name = Name::from_str(value).ok()?;
        return Some(DnsRewrite {
            rcode: ResponseCode::NoError,
            value: Some(RewriteValue::Cname(name)),
        });
    }
    None
}

fn parse_rewrite_full(rcode: &str, rrtype: &str, value: &str) -> Option<DnsRewrite> {
    let rcode = parse_rcode(rcode)?;
    if rcode != ResponseCode::NoError {
        if !rrtype.is_empty() || !value.is_empty() {
            return None;
        }
        return Some(DnsRewrite { rcode, value: None });
    }

    let value = match rrtype {
        "A" => RewriteValue::A(value.parse().ok()?),
        "AAAA" => RewriteValue::Aaaa(value.parse().ok()?),
        "CNAME" => RewriteValue::Cname(Name::from_str(value).ok()?),
        "MX" => {
            let (preference, exchange) = value.split_once(' ')?;
            RewriteValue::Mx(preference.parse().ok()?, Name::from_str(exchange).ok()?)
        }
        "TXT" => RewriteValue::Txt(value.to_string()),
        "PTR" => RewriteValue::Ptr(Name::from_str(value).ok()?),
        _ => return None,
    };
    Some(DnsRewrite {
        rcode: ResponseCode::NoError,
        value: Some(value),
    })
}

fn parse_dnsrewrite_modifier(params: &str, is_exception: bool) -> Option<DnsRewrite> {
    if params.is_empty() {
        // a bare `@@...$dnsrewrite` disables every rewrite for the domain
        if is_exception {
            return Some(DnsRewrite {
                rcode: ResponseCode::NoError,
                value: None,
            });
        }
        debug!("blocking dnsrewrite rule must have a value");
        return None;
    }

    let parts: Vec<&str> = params.split(';').collect();
    let rewrite = match parts.as_slice() {
        [value] => parse_rewrite_shorthand(value),
        [rcode, rrtype, value] => parse_rewrite_full(rcode, rrtype, value),
        _ => None,
    };
    if rewrite.is_none() {
        debug!("malformed dnsrewrite parameters: {params}");
    }
    rewrite
}

fn parse_dnstype_modifier(params: &str, is_exception: bool) -> Option<DnsTypeConstraint> {
    if params.is_empty() {
        if !is_exception {
            debug!("blocking dnstype rule must have some types specified");
            return None;
        }
        return Some(DnsTypeConstraint {
            types: Vec::new(),
            mode: DnsTypeMode::Exclude,
        });
    }

    let mut enabled = Vec::new();
    let mut excluded = Vec::new();
    for token in params.split('|') {
        let (enable, name) = match token.strip_prefix('~') {
            Some(rest) => (false, rest),
            None => (true, token),
        };

        let Ok(rr_type) = RecordType::from_str(name) else {
            debug!("unexpected DNS type: {name}");
            return None;
        };

        let (list_to_check, list_to_insert) = if enable {
            (&excluded, &mut enabled)
        } else {
            (&enabled, &mut excluded)
        };
        if list_to_check.contains(&rr_type) {
            debug!("DNS type can't be both enabled and excluded: {name}");
            return None;
        }
        if list_to_insert.contains(&rr_type) {
            debug!("duplicated DNS type: {name}");
            return None;
        }
        list_to_insert.push(rr_type);
    }

    Some(if enabled.is_empty() {
        DnsTypeConstraint {
            types: excluded,
            mode: DnsTypeMode::Exclude,
        }
    } else {
        DnsTypeConstraint {
            types: enabled,
            mode: DnsTypeMode::Enable,
        }
    })
}

struct ParsedModifiers {
    props: RuleProps,
    dnstype: Option<DnsTypeConstraint>,
    rewrite: Option<DnsRewrite>,
}

fn extract_modifiers(modifiers_str: &str, is_exception: bool) -> Option<ParsedModifiers> {
    let mut out = ParsedModifiers {
        props: RuleProps::default(),
        dnstype: None,
        rewrite: None,
    };
    if modifiers_str.is_empty() {
        return Some(out);
    }

    for modifier in modifiers_str.split(MODIFIERS_DELIMITER) {
        let (name, params) = match modifier.split_once('=') {
            Some((name, params)) => (name, Some(params)),
            None => (modifier, None),
        };

        let prop = match name {
            "important" => {
                if params.is_some() {
                    debug!("modifier can't have parameters: {modifier}");
                    return None;
                }
                RuleProps::IMPORTANT
            }
            "badfilter" => {
                if params.is_some() {
                    debug!("modifier can't have parameters: {modifier}");
                    return None;
                }
                RuleProps::BADFILTER
            }
            "dnstype" => {
                if params == Some("") {
                    debug!("modifier has empty parameters section: {modifier}");
                    return None;
                }
                out.dnstype = Some(parse_dnstype_modifier(params.unwrap_or(""), is_exception)?);
                RuleProps::DNSTYPE
            }
            "dnsrewrite" => {
                if params == Some("") {
                    debug!("modifier has empty parameters section: {modifier}");
                    return None;
                }
                out.rewrite = Some(parse_dnsrewrite_modifier(params.unwrap_or(""), is_exception)?);
                RuleProps::DNSREWRITE
            }
            _ => {
                debug!("unknown modifier: {modifier}");
                return None;
            }
        };

        if out.props.contains(prop) {
            debug!("duplicated modifier: {name}");
            return None;
        }
        out.props.insert(prop);
    }

    Some(out)
}

fn is_too_wide_rule(props: RuleProps, info: &MatchInfo<'_>) -> bool {
    !props.contains(RuleProps::DNSTYPE)
        && !props.contains(RuleProps::DNSREWRITE)
        && (info.text.len() < 3 || info.text.chars().all(|c| matches!(c, '.' | '*')))
}

fn parse_adblock_rule(line: &str) -> Option<Rule> {
    let mut str = line;
    let is_exception = str.starts_with(EXCEPTION_MARKER);
    if is_exception {
        str = &str[EXCEPTION_MARKER.len()..];
    }

    let mut modifiers_str = "";
    if !check_regex(str) {
        (str, modifiers_str) = rsplit2(str, MODIFIERS_MARKER);
    }

    let info = extract_match_info(str);
    let pattern = info.text;

    if !info.is_regex_rule && !is_valid_domain_pattern(pattern) && !is_valid_ip_pattern(pattern) {
        debug!("invalid domain name: {pattern}");
        return None;
    }

    let modifiers = extract_modifiers(modifiers_str, is_exception)?;
    let mut props = modifiers.props;
    props.set(RuleProps::EXCEPTION, is_exception);

    if is_too_wide_rule(props, &info) {
        debug!("too wide rule: {pattern}");
        return None;
    }

    let mut rule = Rule {
        text: line.to_string(),
        filter_id: 0,
        props,
        match_method: MatchMethod::Exact,
        matching_parts: Vec::new(),
        body: RuleBody::Adblock {
            dnstype: modifiers.dnstype,
            rewrite: modifiers.rewrite,
        },
    };

    if props.contains(RuleProps::BADFILTER) {
        return Some(rule);
    }

    let exact = info.mode == pattern_mode::LINE_START | pattern_mode::LINE_END;
    let subdomains = info.mode == pattern_mode::DOMAIN_START | pattern_mode::LINE_END;

    if !info.is_regex_rule && exact && is_ip(pattern) {
        // normalize: compress IPv6, strip brackets
        let addr: IpAddr = pattern.parse().ok()?;
        rule.match_method = MatchMethod::Exact;
        rule.matching_parts = vec![addr.to_string()];
    } else if !info.is_regex_rule && !info.has_wildcard && (exact || subdomains) {
        rule.match_method = if exact {
            MatchMethod::Exact
        } else {
            MatchMethod::Subdomains
        };
        rule.matching_parts = vec![pattern.to_lowercase()];
    } else if !info.is_regex_rule && info.mode == 0 {
        rule.match_method = MatchMethod::Shortcuts;
        rule.matching_parts = pattern
            .split('*')
            .filter(|part| !part.is_empty())
            .map(str::to_lowercase)
            .collect();
    } else {
        if pattern.contains('?') {
            rule.match_method = MatchMethod::Regex;
        } else {
            let mut sanitized = pattern.to_string();
            for re in SHORTCUT_SANITIZERS.iter() {
                sanitized = re.replace_all(&sanitized, "${1}...").into_owned();
            }

            let shortcuts = extract_regex_shortcuts(&sanitized);
            if shortcuts.is_empty() {
                rule.match_method = MatchMethod::Regex;
            } else {
                rule.match_method = MatchMethod::ShortcutsAndRegex;
                rule.matching_parts = shortcuts.iter().map(|s| s.to_lowercase()).collect();
            }
        }

        let re = get_regex(&rule.text);
        if Regex::new(&re).is_err() {
            debug!("invalid regex: {re}");
            return None;
        }
    }

    Some(rule)
}
