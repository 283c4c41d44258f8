//! The per-query state machine.
//!
//! One request flows decode → retransmission check → cache → question
//! filtering → upstream (or synthesized block) → response filtering → DNS64 →
//! cache insert → encode. The forwarder suspends in three places only: the
//! in-flight wait on a duplicate query, the upstream exchange and the DNS64
//! A sub-exchange.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::{Edns, Message, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheKey, ResponseCache};
use crate::clock;
use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::event::{rr_list_to_string, EventSink, RequestProcessedEvent};
use crate::filter::{effective_rules, Engine, FilterParams, Rule, RuleProps};
use crate::upstream::{make_upstream, Upstream};

use super::retransmission::RetransmissionDetector;
use super::rewriter::{self, BlockingSettings};

/// Transport a query arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Out-of-band info about the client connection.
#[derive(Debug, Clone, Copy)]
pub struct MessageInfo {
    pub peer: SocketAddr,
    pub transport: Transport,
}

/// The filtering DNS forwarder.
pub struct Forwarder {
    config: Config,
    blocking: BlockingSettings,
    upstreams: Vec<Arc<dyn Upstream>>,
    fallbacks: Vec<Arc<dyn Upstream>>,
    engine: Arc<Engine>,
    fallback_engine: Engine,
    cache: ResponseCache,
    retransmissions: RetransmissionDetector,
    /// Requests being resolved right now, keyed like the cache. Duplicates
    /// wait here instead of racing to the upstreams.
    pending: Mutex<HashMap<CacheKey, Arc<Notify>>>,
    events: Option<EventSink>,
}

impl Forwarder {
    /// Build the forwarder from configuration. The second element of the pair
    /// is a warning: the forwarder works, but e.g. a filter only loaded
    /// partially.
    pub fn init(config: Config, events: Option<EventSink>) -> Result<(Self, Option<String>)> {
        config.validate()?;

        let upstreams = config
            .upstreams
            .iter()
            .enumerate()
            .map(|(i, u)| make_upstream(u.options(i)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let fallbacks = config
            .fallbacks
            .iter()
            .enumerate()
            .map(|(i, u)| make_upstream(u.options(i)))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Self::with_upstreams(config, upstreams, fallbacks, events)
    }

    /// Build the forwarder around externally constructed upstreams. `init`
    /// goes through here; tests inject mocks the same way.
    pub fn with_upstreams(
        config: Config,
        upstreams: Vec<Arc<dyn Upstream>>,
        fallbacks: Vec<Arc<dyn Upstream>>,
        events: Option<EventSink>,
    ) -> Result<(Self, Option<String>)> {
        if upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams.into());
        }

        let custom_ipv4 = config
            .custom_blocking_ipv4
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(ConfigError::InvalidBlockingIpv4)?;
        let custom_ipv6 = config
            .custom_blocking_ipv6
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(ConfigError::InvalidBlockingIpv6)?;

        let blocking = BlockingSettings {
            adblock_mode: config.adblock_blocking_mode,
            hosts_mode: config.hosts_blocking_mode,
            custom_ipv4,
            custom_ipv6,
            blocked_ttl: config.blocked_response_ttl,
        };

        let params = config
            .filters
            .iter()
            .map(crate::config::FilterConfig::params)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let (engine, warning) = Engine::new(params, config.filter_mem_limit);

        let fallback_engine = build_fallback_engine(&config.fallback_domains)?;

        let cache = ResponseCache::new(config.cache_size, config.optimistic_cache);
        let retransmissions = RetransmissionDetector::new(config.retransmission_window());

        info!(
            upstreams = upstreams.len(),
            fallbacks = fallbacks.len(),
            filters = engine.filter_count(),
            "forwarder initialized"
        );

        Ok((
            Self {
                config,
                blocking,
                upstreams,
                fallbacks,
                engine: Arc::new(engine),
                fallback_engine,
                cache,
                retransmissions,
                pending: Mutex::new(HashMap::new()),
                events,
            },
            warning,
        ))
    }

    /// The configuration the forwarder runs with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The rule engine, for the periodic update task.
    #[must_use]
    pub fn engine(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }

    /// Process one wire message and produce the wire response. Malformed
    /// input is dropped silently.
    #[instrument(skip_all, fields(domain))]
    pub async fn handle_message(
        self: &Arc<Self>,
        message: &[u8],
        info: Option<MessageInfo>,
    ) -> Option<Vec<u8>> {
        let started = clock::now();

        let request = match Message::from_bytes(message) {
            Ok(request) => request,
            Err(err) => {
                debug!("dropping malformed query: {err}");
                return None;
            }
        };
        let Some(question) = request.queries().first().cloned() else {
            debug!("dropping query without a question");
            return None;
        };

        let qtype = question.query_type();
        let domain = question.name().to_utf8();
        let normalized = domain.trim_end_matches('.').to_lowercase();
        tracing::Span::current().record("domain", normalized.as_str());

        let mut event = RequestProcessedEvent {
            domain: domain.clone(),
            query_type: qtype.to_string(),
            ..RequestProcessedEvent::default()
        };

        let retransmitted = self.config.detect_retransmissions
            && info.is_some_and(|info| {
                self.retransmissions.register(
                    info.peer,
                    request.id(),
                    &format!("{normalized}:{qtype}:{}", question.query_class()),
                )
            });
        if retransmitted {
            debug!("retransmitted query, using fallback upstreams only");
        }

        let fallback_only = retransmitted || self.fallback_engine.matches(&normalized, qtype);

        let key = CacheKey::from_request(&request)?;

        // cache lookup, with in-flight deduplication on a miss
        let mut claim = None;
        loop {
            if let Some(hit) = self.cache.get(&key) {
                counter!("dns.queries", "status" => "cache_hit", "query_type" => qtype.to_string())
                    .increment(1);
                let mut response = hit.response;
                response.take_queries();
                response.add_query(question.clone());
                event.cache_hit = true;
                event.upstream_id = hit.upstream_id;

                if hit.expired {
                    // optimistic serve: answer now, refresh behind the scenes
                    let this = Arc::clone(self);
                    let request = request.clone();
                    let key = key.clone();
                    let normalized = normalized.clone();
                    let _ = tokio::spawn(async move {
                        this.refresh_cache_entry(request, key, normalized, qtype, fallback_only)
                            .await;
                    });
                }

                return self.finalize(&request, response, info, event, started);
            }

            let waiter = {
                let mut pending = self.pending.lock();
                match pending.entry(key.clone()) {
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(Arc::new(Notify::new()));
                        None
                    }
                    std::collections::hash_map::Entry::Occupied(slot) => Some(slot.get().clone()),
                }
            };
            match waiter {
                None => {
                    claim = Some(PendingClaim {
                        pending: &self.pending,
                        key: Some(key.clone()),
                    });
                    break;
                }
                Some(notify) => {
                    // identical request in flight: wait and re-check the
                    // cache. Register interest before looking again so a
                    // wakeup between the miss and the await is not lost.
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if self.cache.get(&key).is_some() {
                        continue;
                    }
                    if tokio::time::timeout(self.config.query_timeout(), notified)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        let _claim = claim;

        counter!("dns.queries", "status" => "cache_miss", "query_type" => qtype.to_string())
            .increment(1);

        // filter the question
        let engine_match = self.engine.match_domain(&normalized, qtype);
        self.schedule_refresh_if_outdated(&engine_match.outdated);
        let effective = effective_rules(&engine_match.context.matched_rules, qtype);
        record_rules(&mut event, &effective);

        let has_rewrites = effective
            .iter()
            .any(|rule| !rule.is_exception() && rule.props.contains(RuleProps::DNSREWRITE));

        if has_rewrites {
            let rewritten = rewriter::rewritten_response(
                &request,
                &effective,
                self.blocking.blocked_ttl,
            );
            let mut response = rewritten.response;
            if let Some(target) = rewritten.resolve_cname {
                // resolve the rewrite target and chain its answers
                let sub_request = make_sub_query(request.id(), &target, qtype);
                match self.do_upstream_exchange(&sub_request, fallback_only).await {
                    Ok((sub_response, upstream)) => {
                        event.upstream_id = Some(upstream.id());
                        for answer in sub_response.answers() {
                            response.add_answer(answer.clone());
                        }
                    }
                    Err(err) => debug!("failed to resolve rewrite target {target}: {err}"),
                }
            }
            counter!("dns.queries", "status" => "rewritten", "query_type" => qtype.to_string())
                .increment(1);
            return self.finalize(&request, response, info, event, started);
        }

        let question_whitelisted = match effective.first() {
            Some(rule) if rule.is_exception() => {
                event.whitelist = true;
                true
            }
            Some(rule) => {
                info!("blocked {normalized} by rule '{}'", rule.text);
                counter!("dns.queries", "status" => "blocked", "query_type" => qtype.to_string())
                    .increment(1);
                let response = rewriter::blocked_response(&request, rule, &self.blocking);
                return self.finalize(&request, response, info, event, started);
            }
            None => false,
        };

        // forward to upstream, filter the answer, cache it
        let response = self
            .resolve_via_upstream(
                &request,
                &key,
                qtype,
                question_whitelisted,
                fallback_only,
                &mut event,
            )
            .await;

        self.finalize(&request, response, info, event, started)
    }

    /// Exchange with an upstream and post-process the answer: CNAME and IP
    /// filtering, DNS64 synthesis, DNSSEC scrubbing, cache insertion.
    async fn resolve_via_upstream(
        self: &Arc<Self>,
        request: &Message,
        key: &CacheKey,
        qtype: RecordType,
        question_whitelisted: bool,
        fallback_only: bool,
        event: &mut RequestProcessedEvent,
    ) -> Message {
        let client_do = request
            .extensions()
            .as_ref()
            .map_or(false, |edns| edns.dnssec_ok());

        // ask for DNSSEC records ourselves so the event can report whether
        // the answer was signed
        let our_do = self.config.enable_dnssec_ok && !client_do;
        let outgoing = if our_do {
            let mut outgoing = request.clone();
            let mut edns = outgoing.extensions().clone().unwrap_or_else(Edns::new);
            edns.set_dnssec_ok(true);
            if edns.max_payload() < 1232 {
                edns.set_max_payload(1232);
            }
            *outgoing.extensions_mut() = Some(edns);
            outgoing
        } else {
            request.clone()
        };

        let (mut response, upstream) =
            match self.do_upstream_exchange(&outgoing, fallback_only).await {
                Ok((response, upstream)) => (response, upstream),
                Err(err) => {
                    warn!("every upstream failed: {err}");
                    counter!("dns.queries", "status" => "upstream_error").increment(1);
                    event.error = Some(err);
                    return rewriter::servfail_response(request);
                }
            };
        event.upstream_id = Some(upstream.id());

        if let Some(blocked) = self
            .apply_response_filters(request, &response, qtype, question_whitelisted, event)
        {
            return blocked;
        }

        // DNS64: synthesize AAAA from A when the upstream had none
        if qtype == RecordType::AAAA
            && !self.config.dns64_prefixes.is_empty()
            && response.response_code() == ResponseCode::NoError
            && !response
                .answers()
                .iter()
                .any(|record| record.record_type() == RecordType::AAAA)
        {
            if let Some(name) = request.queries().first().map(Query::name) {
                let sub_request = make_sub_query(request.id(), name, RecordType::A);
                if let Ok(a_response) = upstream.exchange(&sub_request).await {
                    let synthesized = rewriter::synthesize_dns64(
                        request,
                        &a_response,
                        &self.config.dns64_prefixes,
                    );
                    if !synthesized.is_empty() {
                        debug!("synthesized {} DNS64 answers", synthesized.len());
                        response.insert_answers(synthesized);
                    }
                }
            }
        }

        if our_do {
            event.dnssec = rewriter::has_dnssec_records(&response);
        }
        if !client_do {
            rewriter::scrub_dnssec_records(&mut response, qtype);
        }

        if matches!(
            response.response_code(),
            ResponseCode::NoError | ResponseCode::NXDomain
        ) {
            self.cache
                .insert(key.clone(), response.clone(), Some(upstream.id()));
        }

        response
    }

    /// Walk the answer records; CNAME targets and A/AAAA literals re-enter
    /// the rule engine. A blocking verdict replaces the whole response. An
    /// `$important` rule overrides a whitelisted question.
    fn apply_response_filters(
        &self,
        request: &Message,
        response: &Message,
        qtype: RecordType,
        question_whitelisted: bool,
        event: &mut RequestProcessedEvent,
    ) -> Option<Message> {
        for record in response.answers() {
            let target = match record.record_type() {
                RecordType::CNAME => record
                    .data()
                    .and_then(|d| d.as_cname())
                    .map(|cname| cname.0.to_utf8().trim_end_matches('.').to_lowercase()),
                RecordType::A => record.data().and_then(|d| d.as_a()).map(|a| a.0.to_string()),
                RecordType::AAAA => record
                    .data()
                    .and_then(|d| d.as_aaaa())
                    .map(|aaaa| aaaa.0.to_string()),
                _ => None,
            };
            let Some(target) = target else {
                continue;
            };

            let engine_match = self.engine.match_domain(&target, qtype);
            self.schedule_refresh_if_outdated(&engine_match.outdated);
            let effective = effective_rules(&engine_match.context.matched_rules, qtype);
            let Some(rule) = effective.first() else {
                continue;
            };
            if rule.props.contains(RuleProps::DNSREWRITE) {
                continue;
            }
            record_rules(event, &effective);

            if rule.is_exception() {
                event.whitelist = true;
                continue;
            }
            if question_whitelisted && !rule.is_important() {
                continue;
            }

            info!("blocked response for {target} by rule '{}'", rule.text);
            counter!("dns.queries", "status" => "blocked_response").increment(1);
            event.whitelist = false;
            return Some(rewriter::blocked_response(request, rule, &self.blocking));
        }
        None
    }

    /// Ordered failover: each eligible list sorted by RTT, fallbacks after
    /// primaries. A SERVFAIL answer triggers the next candidate but is kept
    /// as a last resort.
    async fn do_upstream_exchange(
        &self,
        request: &Message,
        fallback_only: bool,
    ) -> std::result::Result<(Message, Arc<dyn Upstream>), String> {
        let lists: Vec<&[Arc<dyn Upstream>]> = if fallback_only && !self.fallbacks.is_empty() {
            vec![&self.fallbacks]
        } else if fallback_only {
            vec![&self.upstreams]
        } else {
            vec![&self.upstreams, &self.fallbacks]
        };

        let mut errors = Vec::new();
        let mut last_servfail: Option<(Message, Arc<dyn Upstream>)> = None;

        for list in lists {
            let mut ordered: Vec<Arc<dyn Upstream>> = list.to_vec();
            ordered.sort_by_key(|upstream| upstream.rtt());

            for upstream in ordered {
                let started = Instant::now();
                match upstream.exchange(request).await {
                    Ok(response) => {
                        upstream.adjust_rtt(started.elapsed());
                        if response.response_code() == ResponseCode::ServFail {
                            debug!("{} answered SERVFAIL, trying next", upstream.address());
                            last_servfail = Some((response, upstream));
                            continue;
                        }
                        return Ok((response, upstream));
                    }
                    Err(err) => {
                        upstream.adjust_rtt(started.elapsed());
                        debug!("exchange with {} failed: {err}", upstream.address());
                        errors.push(format!("{}: {err}", upstream.address()));
                    }
                }
            }
        }

        if let Some(result) = last_servfail {
            return Ok(result);
        }
        Err(errors.join("; "))
    }

    /// Background refresh of an optimistically served entry.
    async fn refresh_cache_entry(
        self: Arc<Self>,
        request: Message,
        key: CacheKey,
        normalized: String,
        qtype: RecordType,
        fallback_only: bool,
    ) {
        // the question may have become blocked since the entry was cached
        let engine_match = self.engine.match_domain(&normalized, qtype);
        let effective = effective_rules(&engine_match.context.matched_rules, qtype);
        match effective.first() {
            Some(rule) if !rule.is_exception() => return,
            _ => {}
        }

        let mut event = RequestProcessedEvent::default();
        let _ = self
            .resolve_via_upstream(&request, &key, qtype, false, fallback_only, &mut event)
            .await;
    }

    fn schedule_refresh_if_outdated(&self, outdated: &[i32]) {
        if outdated.is_empty() {
            return;
        }
        warn!("filters {outdated:?} are outdated, scheduling rebuild");
        let engine = Arc::clone(&self.engine);
        let _ = tokio::task::spawn_blocking(move || engine.refresh_outdated());
    }

    /// Encode the response, truncating over UDP when it exceeds the
    /// negotiated payload, and emit the event.
    fn finalize(
        &self,
        request: &Message,
        mut response: Message,
        info: Option<MessageInfo>,
        mut event: RequestProcessedEvent,
        started: std::time::Instant,
    ) -> Option<Vec<u8>> {
        response.set_id(request.id());

        let mut bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to encode response: {err}");
                return None;
            }
        };

        let udp = info.map_or(false, |info| info.transport == Transport::Udp);
        if udp && bytes.len() > rewriter::max_udp_payload(request) {
            debug!("response of {} bytes truncated", bytes.len());
            response = rewriter::truncated_response(request);
            bytes = response.to_bytes().ok()?;
        }

        event.status = format!("{:?}", response.response_code());
        event.answer = rr_list_to_string(response.answers());
        event.elapsed = clock::now().duration_since(started);

        if let Some(sink) = &self.events {
            sink(event);
        }
        Some(bytes)
    }
}

/// Removes the in-flight claim and wakes the waiters, even on panic.
struct PendingClaim<'a> {
    pending: &'a Mutex<HashMap<CacheKey, Arc<Notify>>>,
    key: Option<CacheKey>,
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Some(notify) = self.pending.lock().remove(&key) {
                notify.notify_waiters();
            }
        }
    }
}

fn record_rules(event: &mut RequestProcessedEvent, rules: &[Rule]) {
    for rule in rules {
        event.filter_list_ids.push(rule.filter_id);
        event.rules.push(rule.text.clone());
    }
}

fn make_sub_query(id: u16, name: &Name, qtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(id);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name.clone(), qtype));
    message
}

/// The fallback-domain globs, compiled through the rule engine as one
/// in-memory filter of line-anchored patterns.
fn build_fallback_engine(globs: &[String]) -> Result<Engine> {
    if globs.is_empty() {
        return Ok(Engine::empty());
    }

    let mut rules = String::new();
    for glob in globs {
        let line = format!("|{glob}^");
        if crate::filter::parse(&line).is_none() {
            return Err(ConfigError::Validation(format!(
                "invalid fallback domain {glob:?}"
            ))
            .into());
        }
        rules.push_str(&line);
        rules.push('\n');
    }

    let (engine, _) = Engine::new(vec![FilterParams::in_memory(0, rules)], 0);
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::event::RequestProcessedEvent;
    use crate::upstream::tests::MockUpstream;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{RData, Record};
    use std::str::FromStr;

    struct TestSetup {
        forwarder: Arc<Forwarder>,
        primary: Arc<MockUpstream>,
        fallback: Arc<MockUpstream>,
        last_event: Arc<Mutex<Option<RequestProcessedEvent>>>,
    }

    fn base_config() -> Config {
        let mut config = Config::parse(
            r#"
            [[upstreams]]
            address = "8.8.8.8"
            "#,
        )
        .unwrap();
        // keep the tests immune to clock shifts from elsewhere in the binary
        config.retransmission_window_ms = 3_600_000;
        config
    }

    fn with_rules(mut config: Config, rules: &str) -> Config {
        config.filters = vec![FilterConfig {
            id: 1,
            path: None,
            rules: Some(rules.to_string()),
        }];
        config
    }

    fn setup(config: Config) -> TestSetup {
        let primary = Arc::new(MockUpstream::new(42));
        let fallback = Arc::new(MockUpstream::new(4242));

        let last_event: Arc<Mutex<Option<RequestProcessedEvent>>> = Arc::new(Mutex::new(None));
        let sink_target = Arc::clone(&last_event);
        let sink: EventSink = Arc::new(move |event| {
            *sink_target.lock() = Some(event);
        });

        let (forwarder, warning) = Forwarder::with_upstreams(
            config,
            vec![Arc::clone(&primary) as Arc<dyn Upstream>],
            vec![Arc::clone(&fallback) as Arc<dyn Upstream>],
            Some(sink),
        )
        .unwrap();
        assert!(warning.is_none());

        TestSetup {
            forwarder: Arc::new(forwarder),
            primary,
            fallback,
            last_event,
        }
    }

    fn query_bytes(domain: &str, qtype: RecordType, id: u16) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(domain).unwrap(), qtype));
        message.to_bytes().unwrap()
    }

    fn noerror_response(domain: &str, qtype: RecordType, answers: Vec<Record>) -> Message {
        let mut message = Message::new();
        message
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError)
            .set_recursion_available(true);
        message.add_query(Query::query(Name::from_str(domain).unwrap(), qtype));
        for answer in answers {
            message.add_answer(answer);
        }
        message
    }

    fn a_record(domain: &str, ttl: u32, addr: &str) -> Record {
        Record::from_rdata(
            Name::from_str(domain).unwrap(),
            ttl,
            RData::A(A(addr.parse().unwrap())),
        )
    }

    async fn ask(setup: &TestSetup, domain: &str, qtype: RecordType, id: u16) -> Message {
        let bytes = setup
            .forwarder
            .handle_message(&query_bytes(domain, qtype, id), None)
            .await
            .expect("a response");
        Message::from_bytes(&bytes).unwrap()
    }

    fn event(setup: &TestSetup) -> RequestProcessedEvent {
        setup.last_event.lock().clone().expect("an event")
    }

    #[tokio::test]
    async fn should_block_question_matching_adblock_rule() {
        let setup = setup(with_rules(base_config(), "||blocked.example^\n"));

        let response = ask(&setup, "ads.blocked.example", RecordType::A, 1).await;
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert_eq!(response.id(), 1);
        assert_eq!(setup.primary.exchange_count(), 0);

        let event = event(&setup);
        assert_eq!(event.rules, vec!["||blocked.example^"]);
        assert_eq!(event.filter_list_ids, vec![1]);
        assert!(!event.whitelist);
        assert!(!event.cache_hit);
    }

    #[tokio::test]
    async fn should_forward_when_no_rule_matches() {
        let setup = setup(with_rules(base_config(), "||blocked.example^\n"));

        let response = ask(&setup, "allowed.example", RecordType::A, 2).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(setup.primary.exchange_count(), 1);
        assert_eq!(event(&setup).upstream_id, Some(42));
        assert!(event(&setup).rules.is_empty());
    }

    #[tokio::test]
    async fn should_gate_blocking_on_dnstype() {
        let setup = setup(with_rules(base_config(), "example.com$dnstype=A|AAAA\n"));

        let response = ask(&setup, "example.com", RecordType::A, 3).await;
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert_eq!(response.answers().len(), 0);
        assert_eq!(event(&setup).rules.len(), 1);
        assert_eq!(setup.primary.exchange_count(), 0);

        let response = ask(&setup, "example.com", RecordType::MX, 4).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(setup.primary.exchange_count(), 1);
        assert!(event(&setup).rules.is_empty());
    }

    #[tokio::test]
    async fn should_union_dnsrewrite_rules() {
        let setup = setup(with_rules(
            base_config(),
            "example.com$dnsrewrite=1.2.3.4\n\
             example.com$dnsrewrite=NOERROR;A;100.200.200.100\n\
             example.com$dnsrewrite=NOERROR;MX;42 example.mail\n\
             @@example.com$dnsrewrite=1.2.3.4\n",
        ));

        let response = ask(&setup, "example.com", RecordType::A, 5).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 2);

        let event = event(&setup);
        assert_eq!(event.rules.len(), 3);
        assert!(!event
            .rules
            .contains(&"example.com$dnsrewrite=1.2.3.4".to_string()));
        assert_eq!(setup.primary.exchange_count(), 0);
    }

    #[tokio::test]
    async fn should_resolve_cname_rewrite_target() {
        let setup = setup(with_rules(
            base_config(),
            "example.com$dnsrewrite=target.example.net\n",
        ));
        setup
            .primary
            .add_response(
                "target.example.net",
                RecordType::A,
                noerror_response(
                    "target.example.net",
                    RecordType::A,
                    vec![a_record("target.example.net", 300, "10.0.0.1")],
                ),
            )
            .await;

        let response = ask(&setup, "example.com", RecordType::A, 6).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 2);
        assert_eq!(response.answers()[0].record_type(), RecordType::CNAME);
        assert_eq!(response.answers()[1].record_type(), RecordType::A);
        assert_eq!(event(&setup).rules.len(), 1);
    }

    #[tokio::test]
    async fn should_let_exception_whitelist_question() {
        let setup = setup(with_rules(
            base_config(),
            "||example.com^\n@@||example.com^\n",
        ));

        let response = ask(&setup, "example.com", RecordType::A, 7).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(setup.primary.exchange_count(), 1);

        let event = event(&setup);
        assert!(event.whitelist);
        assert_eq!(event.rules, vec!["@@||example.com^"]);
    }

    #[tokio::test]
    async fn should_block_cname_in_response() {
        let setup = setup(with_rules(base_config(), "||tracker.evil.example^\n"));
        let cname = Record::from_rdata(
            Name::from_str("example.com").unwrap(),
            300,
            RData::CNAME(CNAME(Name::from_str("cdn.tracker.evil.example.").unwrap())),
        );
        setup
            .primary
            .add_response(
                "example.com",
                RecordType::A,
                noerror_response(
                    "example.com",
                    RecordType::A,
                    vec![cname, a_record("cdn.tracker.evil.example", 300, "9.9.9.9")],
                ),
            )
            .await;

        let response = ask(&setup, "example.com", RecordType::A, 8).await;
        assert_eq!(response.response_code(), ResponseCode::Refused);

        let event = event(&setup);
        assert_eq!(event.filter_list_ids, vec![1]);
        assert!(!event.whitelist);
    }

    #[tokio::test]
    async fn should_block_answer_address() {
        let setup = setup(with_rules(base_config(), "|6.6.6.6^\n"));
        setup
            .primary
            .add_response(
                "example.com",
                RecordType::A,
                noerror_response(
                    "example.com",
                    RecordType::A,
                    vec![a_record("example.com", 300, "6.6.6.6")],
                ),
            )
            .await;

        let response = ask(&setup, "example.com", RecordType::A, 9).await;
        assert_eq!(response.response_code(), ResponseCode::Refused);
    }

    #[tokio::test]
    async fn should_override_whitelist_with_important_response_rule() {
        let setup = setup(with_rules(
            base_config(),
            "@@||example.com^\n|6.6.6.6^$important\n",
        ));
        setup
            .primary
            .add_response(
                "example.com",
                RecordType::A,
                noerror_response(
                    "example.com",
                    RecordType::A,
                    vec![a_record("example.com", 300, "6.6.6.6")],
                ),
            )
            .await;

        let response = ask(&setup, "example.com", RecordType::A, 10).await;
        assert_eq!(response.response_code(), ResponseCode::Refused);

        let event = event(&setup);
        assert_eq!(event.filter_list_ids.len(), 2);
        assert!(!event.whitelist);
    }

    #[tokio::test]
    async fn should_use_fallbacks_for_fallback_domains() {
        let setup = setup(base_config());

        let _ = ask(&setup, "router.local", RecordType::A, 11).await;
        assert_eq!(setup.primary.exchange_count(), 0);
        assert_eq!(setup.fallback.exchange_count(), 1);
        assert_eq!(event(&setup).upstream_id, Some(4242));

        let _ = ask(&setup, "mygateway", RecordType::A, 12).await;
        assert_eq!(setup.fallback.exchange_count(), 2);

        let _ = ask(&setup, "example.com", RecordType::A, 13).await;
        assert_eq!(setup.primary.exchange_count(), 1);
    }

    #[tokio::test]
    async fn should_use_fallbacks_for_retransmitted_query() {
        let setup = setup(base_config());
        let info = MessageInfo {
            peer: "127.0.0.1:5555".parse().unwrap(),
            transport: Transport::Udp,
        };

        let bytes = query_bytes("slow.example", RecordType::A, 77);
        let first = setup.forwarder.handle_message(&bytes, Some(info)).await;
        assert!(first.is_some());
        assert_eq!(setup.primary.exchange_count(), 1);
        assert_eq!(setup.fallback.exchange_count(), 0);

        let second = setup.forwarder.handle_message(&bytes, Some(info)).await;
        assert!(second.is_some());
        assert_eq!(setup.primary.exchange_count(), 1);
        assert_eq!(setup.fallback.exchange_count(), 1);
        assert_eq!(event(&setup).upstream_id, Some(4242));
    }

    #[tokio::test]
    async fn should_synthesize_servfail_when_every_upstream_fails() {
        let setup = setup(base_config());
        setup.primary.set_error("connection refused").await;
        setup.fallback.set_error("connection refused").await;

        let response = ask(&setup, "example.com", RecordType::A, 14).await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert!(event(&setup).error.is_some());
    }

    #[tokio::test]
    async fn should_try_fallback_after_primary_servfail() {
        let setup = setup(base_config());
        let mut servfail = Message::new();
        servfail
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::ServFail);
        setup.primary.set_default_response(servfail).await;

        let response = ask(&setup, "example.com", RecordType::A, 15).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(event(&setup).upstream_id, Some(4242));
    }

    #[tokio::test]
    async fn should_synthesize_dns64_answers() {
        let mut config = base_config();
        config.dns64_prefixes = vec!["64:ff9b::/96".parse().unwrap()];
        let setup = setup(config);

        setup
            .primary
            .add_response(
                "ipv4only.example",
                RecordType::AAAA,
                noerror_response("ipv4only.example", RecordType::AAAA, vec![]),
            )
            .await;
        setup
            .primary
            .add_response(
                "ipv4only.example",
                RecordType::A,
                noerror_response(
                    "ipv4only.example",
                    RecordType::A,
                    vec![a_record("ipv4only.example", 60, "192.0.2.1")],
                ),
            )
            .await;

        let response = ask(&setup, "ipv4only.example", RecordType::AAAA, 16).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
        let aaaa = response.answers()[0].data().unwrap().as_aaaa().unwrap();
        assert_eq!(aaaa.0, "64:ff9b::c000:201".parse::<std::net::Ipv6Addr>().unwrap());
        // one exchange for the AAAA, one for the A sub-query
        assert_eq!(setup.primary.exchange_count(), 2);
    }

    #[tokio::test]
    async fn should_not_synthesize_dns64_when_aaaa_answer_exists() {
        let mut config = base_config();
        config.dns64_prefixes = vec!["64:ff9b::/96".parse().unwrap()];
        let setup = setup(config);

        let aaaa = Record::from_rdata(
            Name::from_str("dual.example").unwrap(),
            60,
            RData::AAAA(AAAA("2001:db8::1".parse().unwrap())),
        );
        setup
            .primary
            .add_response(
                "dual.example",
                RecordType::AAAA,
                noerror_response("dual.example", RecordType::AAAA, vec![aaaa]),
            )
            .await;

        let response = ask(&setup, "dual.example", RecordType::AAAA, 17).await;
        assert_eq!(response.answers().len(), 1);
        assert_eq!(setup.primary.exchange_count(), 1);
    }

    #[tokio::test]
    async fn should_serve_second_identical_query_from_cache() {
        let setup = setup(base_config());
        setup
            .primary
            .add_response(
                "cached.example",
                RecordType::A,
                noerror_response(
                    "cached.example",
                    RecordType::A,
                    vec![a_record("cached.example", 1_000_000, "1.2.3.4")],
                ),
            )
            .await;

        let first = ask(&setup, "cached.example", RecordType::A, 18).await;
        assert_eq!(first.id(), 18);
        assert!(!event(&setup).cache_hit);

        let second = ask(&setup, "CACHED.example", RecordType::A, 19).await;
        assert_eq!(second.id(), 19);
        assert_eq!(second.answers().len(), 1);
        assert!(event(&setup).cache_hit);
        assert_eq!(event(&setup).upstream_id, Some(42));
        assert_eq!(setup.primary.exchange_count(), 1);
        // the question section follows the latest request
        assert_eq!(
            second.queries()[0].name().to_utf8(),
            "CACHED.example."
        );
    }

    #[tokio::test]
    async fn should_not_cache_blocked_responses() {
        let setup = setup(with_rules(base_config(), "||blocked.example^\n"));

        let _ = ask(&setup, "blocked.example", RecordType::A, 20).await;
        let _ = ask(&setup, "blocked.example", RecordType::A, 21).await;
        assert!(!event(&setup).cache_hit);
    }

    #[tokio::test]
    async fn should_truncate_large_udp_response() {
        let setup = setup(base_config());
        let answers: Vec<Record> = (0..40)
            .map(|i| a_record("big.example", 300, &format!("10.0.{}.{}", i / 256, i % 256)))
            .collect();
        setup
            .primary
            .add_response(
                "big.example",
                RecordType::A,
                noerror_response("big.example", RecordType::A, answers),
            )
            .await;

        let info = MessageInfo {
            peer: "127.0.0.1:5556".parse().unwrap(),
            transport: Transport::Udp,
        };
        let bytes = setup
            .forwarder
            .handle_message(&query_bytes("big.example", RecordType::A, 22), Some(info))
            .await
            .unwrap();
        assert!(bytes.len() <= 512);

        let response = Message::from_bytes(&bytes).unwrap();
        assert!(response.truncated());
        assert!(response.answers().is_empty());

        // the same response fits over TCP
        let info = MessageInfo {
            peer: "127.0.0.1:5556".parse().unwrap(),
            transport: Transport::Tcp,
        };
        let bytes = setup
            .forwarder
            .handle_message(&query_bytes("big.example", RecordType::A, 23), Some(info))
            .await
            .unwrap();
        let response = Message::from_bytes(&bytes).unwrap();
        assert!(!response.truncated());
        assert_eq!(response.answers().len(), 40);
    }

    #[tokio::test]
    async fn should_drop_malformed_and_questionless_messages() {
        let setup = setup(base_config());
        assert!(setup.forwarder.handle_message(&[0x13, 0x37], None).await.is_none());

        let empty = Message::new().to_bytes().unwrap();
        assert!(setup.forwarder.handle_message(&empty, None).await.is_none());
    }

    #[tokio::test]
    async fn should_report_answer_text_and_status_in_event() {
        let setup = setup(base_config());
        setup
            .primary
            .add_response(
                "text.example",
                RecordType::A,
                noerror_response(
                    "text.example",
                    RecordType::A,
                    vec![a_record("text.example", 300, "1.2.3.4")],
                ),
            )
            .await;

        let _ = ask(&setup, "text.example", RecordType::A, 24).await;
        let event = event(&setup);
        assert_eq!(event.domain, "text.example.");
        assert_eq!(event.query_type, "A");
        assert_eq!(event.status, "NoError");
        assert_eq!(event.answer, "A, 1.2.3.4\n");
        assert!(!event.dnssec);
    }

    #[tokio::test]
    async fn should_reject_invalid_custom_blocking_address() {
        let mut config = base_config();
        config.custom_blocking_ipv4 = Some("abracadabra".to_string());
        let result = Forwarder::with_upstreams(
            config,
            vec![Arc::new(MockUpstream::new(1)) as Arc<dyn Upstream>],
            Vec::new(),
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn should_answer_hosts_rule_address_in_address_mode() {
        let setup = setup(with_rules(
            base_config(),
            "127.0.0.1 hosts-style-loopback.com\n1.2.3.4 hosts-style-custom.com\n",
        ));

        let response = ask(&setup, "hosts-style-loopback.com", RecordType::A, 25).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers()[0].data().unwrap().to_string(), "0.0.0.0");

        let response = ask(&setup, "hosts-style-custom.com", RecordType::A, 26).await;
        assert_eq!(response.answers()[0].data().unwrap().to_string(), "1.2.3.4");
    }
}

