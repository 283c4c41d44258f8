//! Rule data model produced by the parser.
//!
//! A rule is a shared header (original text, owning filter list id, property
//! bitset) plus a body that is either adblock-style or `/etc/hosts`-style.

use std::net::IpAddr;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, RecordType};

/// Property bitset carried by every rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleProps(u8);

impl RuleProps {
    /// `@@` exception rule.
    pub const EXCEPTION: Self = Self(1 << 0);
    /// `$important` modifier.
    pub const IMPORTANT: Self = Self(1 << 1);
    /// `$badfilter` modifier.
    pub const BADFILTER: Self = Self(1 << 2);
    /// `$dnstype` modifier.
    pub const DNSTYPE: Self = Self(1 << 3);
    /// `$dnsrewrite` modifier.
    pub const DNSREWRITE: Self = Self(1 << 4);

    #[must_use]
    pub fn contains(self, prop: Self) -> bool {
        self.0 & prop.0 == prop.0
    }

    pub fn insert(&mut self, prop: Self) {
        self.0 |= prop.0;
    }

    pub fn set(&mut self, prop: Self, value: bool) {
        if value {
            self.0 |= prop.0;
        } else {
            self.0 &= !prop.0;
        }
    }
}

/// How a rule's pattern is evaluated against a host name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    /// Exact string equality with one of the matching parts.
    Exact,
    /// A matching part equals the host or one of its parent domains.
    Subdomains,
    /// Every matching part occurs in the host, in order.
    Shortcuts,
    /// Shortcut check first, then the synthesized regex must match.
    ShortcutsAndRegex,
    /// The compiled regex must match the host or one of its parent domains.
    Regex,
}

/// `$dnstype` evaluation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsTypeMode {
    /// The request type must be in the list.
    Enable,
    /// The request type must not be in the list.
    Exclude,
}

/// Parsed `$dnstype` constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsTypeConstraint {
    pub types: Vec<RecordType>,
    pub mode: DnsTypeMode,
}

impl DnsTypeConstraint {
    /// Whether a request of `rr_type` passes this constraint.
    #[must_use]
    pub fn allows(&self, rr_type: RecordType) -> bool {
        match self.mode {
            DnsTypeMode::Enable => self.types.contains(&rr_type),
            DnsTypeMode::Exclude => !self.types.contains(&rr_type),
        }
    }
}

/// Record value produced by a `$dnsrewrite` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteValue {
    A(std::net::Ipv4Addr),
    Aaaa(std::net::Ipv6Addr),
    Cname(Name),
    Mx(u16, Name),
    Txt(String),
    Ptr(Name),
}

/// Parsed `$dnsrewrite` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRewrite {
    pub rcode: ResponseCode,
    pub value: Option<RewriteValue>,
}

/// Rule body variants.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleBody {
    Adblock {
        dnstype: Option<DnsTypeConstraint>,
        rewrite: Option<DnsRewrite>,
    },
    /// `/etc/hosts`-style line: an IP literal followed by domain names.
    Hosts { ip: IpAddr },
}

/// A parsed filtering rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// The original (trimmed) rule text.
    pub text: String,
    /// Id of the filter list the rule came from, assigned at load time.
    pub filter_id: i32,
    pub props: RuleProps,
    pub match_method: MatchMethod,
    /// Lowercased pattern parts; meaning depends on `match_method`.
    pub matching_parts: Vec<String>,
    pub body: RuleBody,
}

impl Rule {
    #[must_use]
    pub fn is_exception(&self) -> bool {
        self.props.contains(RuleProps::EXCEPTION)
    }

    #[must_use]
    pub fn is_important(&self) -> bool {
        self.props.contains(RuleProps::IMPORTANT)
    }

    #[must_use]
    pub fn is_badfilter(&self) -> bool {
        self.props.contains(RuleProps::BADFILTER)
    }

    #[must_use]
    pub fn is_hosts_rule(&self) -> bool {
        matches!(self.body, RuleBody::Hosts { .. })
    }

    /// The `$dnsrewrite` action, if the rule carries one.
    #[must_use]
    pub fn rewrite(&self) -> Option<&DnsRewrite> {
        match &self.body {
            RuleBody::Adblock { rewrite, .. } => rewrite.as_ref(),
            RuleBody::Hosts { .. } => None,
        }
    }

    /// The `$dnstype` constraint, if the rule carries one.
    #[must_use]
    pub fn dnstype(&self) -> Option<&DnsTypeConstraint> {
        match &self.body {
            RuleBody::Adblock { dnstype, .. } => dnstype.as_ref(),
            RuleBody::Hosts { .. } => None,
        }
    }
}
