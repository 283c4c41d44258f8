//! The rule engine.
//!
//! Parses adblock/hosts-style rule lists, indexes them for sublinear lookup
//! and evaluates queries against the index.
//!
//! # Supported syntax
//!
//! - **Adblock-style**: `[@@]pattern[$modifier[,modifier]...]` with bare,
//!   `||`-anchored, `|`-anchored and `/regex/` patterns and the `important`,
//!   `badfilter`, `dnstype` and `dnsrewrite` modifiers
//! - **Hosts-style**: `IP domain [domain...] [# comment]`
//! - **Plain domains**: one domain per line
//! - Comments: leading `!` or `#`
//!
//! # Example
//!
//! ```
//! use dnsgate::filter::{Engine, FilterParams, effective_rules};
//! use hickory_proto::rr::RecordType;
//!
//! let (engine, warning) = Engine::new(
//!     vec![FilterParams::in_memory(1, "||ads.example.org^\n")],
//!     0,
//! );
//! assert!(warning.is_none());
//!
//! let result = engine.match_domain("tracking.ads.example.org", RecordType::A);
//! let effective = effective_rules(&result.context.matched_rules, RecordType::A);
//! assert_eq!(effective.len(), 1);
//! ```

mod engine;
mod index;
mod matcher;
mod parser;
mod rule;
mod source;

pub use engine::{Engine, EngineMatch};
pub use index::{Filter, LoadResult, SHORTCUT_LENGTH};
pub use matcher::{effective_rules, MatchContext};
pub use parser::{is_comment, parse, text_without_badfilter};
pub use rule::{
    DnsRewrite, DnsTypeConstraint, DnsTypeMode, MatchMethod, RewriteValue, Rule, RuleBody,
    RuleProps,
};
pub use source::{FilterParams, RuleSource};
