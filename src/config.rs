//! Configuration loading and validation.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv6Net;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::filter::FilterParams;
use crate::upstream;

/// Main configuration for the dnsgate forwarder.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the UDP and TCP listeners bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Primary upstream servers, tried in RTT order.
    pub upstreams: Vec<UpstreamConfig>,

    /// Fallback servers for when every primary fails, for retransmitted
    /// queries and for fallback-domain questions.
    #[serde(default)]
    pub fallbacks: Vec<UpstreamConfig>,

    /// Filter lists, applied in order.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    /// Shared memory cap in bytes for all loaded filters. Zero is unlimited.
    #[serde(default)]
    pub filter_mem_limit: usize,

    /// How often to check filter files for changes.
    #[serde(default = "default_filter_update_interval")]
    pub filter_update_interval_secs: u64,

    /// Response cache capacity in entries. Zero disables the cache.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Serve expired cache entries with a TTL of 1 while refreshing them in
    /// the background.
    #[serde(default)]
    pub optimistic_cache: bool,

    /// How adblock-style blocking rules answer.
    #[serde(default = "default_adblock_blocking_mode")]
    pub adblock_blocking_mode: BlockingMode,

    /// How hosts-style blocking rules answer.
    #[serde(default = "default_hosts_blocking_mode")]
    pub hosts_blocking_mode: BlockingMode,

    /// Address returned for blocked A queries in `address` mode.
    #[serde(default)]
    pub custom_blocking_ipv4: Option<String>,

    /// Address returned for blocked AAAA queries in `address` mode.
    #[serde(default)]
    pub custom_blocking_ipv6: Option<String>,

    /// TTL of synthesized blocking responses.
    #[serde(default = "default_blocked_response_ttl")]
    pub blocked_response_ttl: u32,

    /// Request DNSSEC records from upstreams and report whether answers were
    /// signed, scrubbing the records from responses to clients that did not
    /// ask for them.
    #[serde(default)]
    pub enable_dnssec_ok: bool,

    /// DNS64 prefixes for AAAA synthesis. Empty disables DNS64.
    #[serde(default)]
    pub dns64_prefixes: Vec<Ipv6Net>,

    /// Domain globs routed straight to the fallback upstreams.
    #[serde(default = "default_fallback_domains")]
    pub fallback_domains: Vec<String>,

    /// Detect client retransmissions and serve them through fallbacks.
    #[serde(default = "default_true")]
    pub detect_retransmissions: bool,

    /// Window within which a repeated query counts as a retransmission.
    #[serde(default = "default_retransmission_window_ms")]
    pub retransmission_window_ms: u64,

    /// Overall per-request deadline.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Prometheus metrics exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// One upstream server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// `ip[:port]`, `tcp://...`, `tls://...`, `https://...`, `quic://...`
    /// or `sdns://...`.
    pub address: String,

    /// Id reported in events; defaults to the position in the list.
    #[serde(default)]
    pub id: Option<i32>,

    /// Exchange timeout; defaults to 5000 ms.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl UpstreamConfig {
    /// Build the options for this upstream, with `index` supplying the
    /// default id.
    #[must_use]
    pub fn options(&self, index: usize) -> upstream::UpstreamOptions {
        upstream::UpstreamOptions {
            address: self.address.clone(),
            id: self.id.unwrap_or(index as i32),
            timeout: self
                .timeout_ms
                .map_or(upstream::DEFAULT_TIMEOUT, Duration::from_millis),
        }
    }
}

/// One filter list: either a file path or an inline rule blob.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub id: i32,

    /// Path to the rule list file.
    #[serde(default)]
    pub path: Option<String>,

    /// Inline rules, one per line.
    #[serde(default)]
    pub rules: Option<String>,
}

impl FilterConfig {
    /// Convert to engine parameters.
    pub fn params(&self) -> std::result::Result<FilterParams, ConfigError> {
        match (&self.path, &self.rules) {
            (Some(path), None) => Ok(FilterParams::from_file(self.id, path.clone())),
            (None, Some(rules)) => Ok(FilterParams::in_memory(self.id, rules.clone())),
            _ => Err(ConfigError::Validation(format!(
                "filter {} must have exactly one of `path` and `rules`",
                self.id
            ))),
        }
    }
}

/// Response synthesized for a blocked query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockingMode {
    /// RCODE=REFUSED, no records.
    Refused,
    /// RCODE=NXDOMAIN with a synthesized SOA.
    Nxdomain,
    /// NOERROR with the configured or unspecified address.
    Address,
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

fn default_bind() -> SocketAddr {
    "127.0.0.1:5353".parse().unwrap()
}

fn default_filter_update_interval() -> u64 {
    60
}

const fn default_cache_size() -> usize {
    1000
}

const fn default_adblock_blocking_mode() -> BlockingMode {
    BlockingMode::Refused
}

const fn default_hosts_blocking_mode() -> BlockingMode {
    BlockingMode::Address
}

const fn default_blocked_response_ttl() -> u32 {
    3600
}

const fn default_true() -> bool {
    true
}

const fn default_retransmission_window_ms() -> u64 {
    1000
}

const fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_metrics_listen() -> SocketAddr {
    "127.0.0.1:9090".parse().unwrap()
}

/// Private-use and gateway suffixes plus the published VoWiFi EPDG hosts,
/// which must resolve through the system resolver even when the regular
/// upstreams go through a tunnel.
pub fn default_fallback_domains() -> Vec<String> {
    [
        "*.local",
        "mygateway",
        "epdg.epc.aptg.com.tw",
        "epdg.epc.att.net",
        "epdg.mobileone.net.sg",
        "primgw.vowifina.spcsdns.net",
        "swu-loopback-epdg.qualcomm.com",
        "vowifi.jio.com",
        "weconnect.globe.com.ph",
        "wlan.three.com.hk",
        "wo.vzwwo.com",
        "epdg.epc.*.pub.3gppnetwork.org",
        "*.epdg.epc.*.pub.3gppnetwork.org",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate settings that do not need I/O. Address-level validation of
    /// upstreams and blocking addresses happens in `Forwarder::init`.
    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams.into());
        }

        for filter in &self.filters {
            filter.params()?;
        }

        Ok(())
    }

    /// The per-request deadline.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// The retransmission window.
    #[must_use]
    pub fn retransmission_window(&self) -> Duration {
        Duration::from_millis(self.retransmission_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_minimal_config() {
        let config = Config::parse(
            r#"
            [[upstreams]]
            address = "8.8.8.8"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.cache_size, 1000);
        assert!(!config.optimistic_cache);
        assert_eq!(config.adblock_blocking_mode, BlockingMode::Refused);
        assert_eq!(config.hosts_blocking_mode, BlockingMode::Address);
        assert!(!config.fallback_domains.is_empty());
    }

    #[test]
    fn should_parse_full_config() {
        let config = Config::parse(
            r#"
            bind = "0.0.0.0:53"
            cache_size = 5
            optimistic_cache = true
            adblock_blocking_mode = "nxdomain"
            hosts_blocking_mode = "refused"
            custom_blocking_ipv4 = "4.3.2.1"
            custom_blocking_ipv6 = "43::21"
            enable_dnssec_ok = true
            dns64_prefixes = ["64:ff9b::/96"]
            fallback_domains = ["*.company.local"]

            [[upstreams]]
            address = "8.8.8.8"
            id = 42

            [[fallbacks]]
            address = "tcp://9.9.9.9"
            id = 4242
            timeout_ms = 2000

            [[filters]]
            id = 1
            rules = "||ads.example.org^"

            [metrics]
            enabled = true
            listen = "127.0.0.1:9100"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstreams[0].id, Some(42));
        assert_eq!(config.fallbacks[0].timeout_ms, Some(2000));
        assert_eq!(config.adblock_blocking_mode, BlockingMode::Nxdomain);
        assert_eq!(config.dns64_prefixes.len(), 1);
        assert_eq!(config.fallback_domains, vec!["*.company.local"]);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn should_reject_empty_upstreams() {
        let result = Config::parse("upstreams = []");
        assert!(result.is_err());
    }

    #[test]
    fn should_reject_filter_with_both_path_and_rules() {
        let result = Config::parse(
            r#"
            [[upstreams]]
            address = "8.8.8.8"

            [[filters]]
            id = 1
            path = "rules.txt"
            rules = "||ads.example.org^"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn should_reject_unknown_fields() {
        let result = Config::parse(
            r#"
            upstream_resolver = "1.1.1.1:53"

            [[upstreams]]
            address = "8.8.8.8"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn should_default_upstream_id_to_position() {
        let config = Config::parse(
            r#"
            [[upstreams]]
            address = "8.8.8.8"

            [[upstreams]]
            address = "1.1.1.1"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstreams[1].options(1).id, 1);
        assert_eq!(
            config.upstreams[0].options(0).timeout,
            upstream::DEFAULT_TIMEOUT
        );
    }
}
