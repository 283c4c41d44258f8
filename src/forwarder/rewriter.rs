//! Response synthesis and rewriting.
//!
//! Builds blocked responses according to the configured blocking modes,
//! materializes `$dnsrewrite` actions, synthesizes DNS64 AAAA records,
//! scrubs DNSSEC records the client did not ask for and truncates UDP
//! responses past the negotiated payload size.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, PTR, SOA, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use ipnet::Ipv6Net;

use crate::config::BlockingMode;
use crate::filter::{RewriteValue, Rule, RuleBody, RuleProps};

/// Maximum UDP response size without EDNS, RFC 1035 §4.2.1.
pub const MAX_UDP_PAYLOAD_NO_EDNS: usize = 512;

/// Settings that shape synthesized blocking responses.
#[derive(Debug, Clone)]
pub struct BlockingSettings {
    pub adblock_mode: BlockingMode,
    pub hosts_mode: BlockingMode,
    pub custom_ipv4: Option<Ipv4Addr>,
    pub custom_ipv6: Option<Ipv6Addr>,
    pub blocked_ttl: u32,
}

/// A response skeleton echoing the request's id, question and RD flag.
fn response_skeleton(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(rcode);
    for question in request.queries() {
        response.add_query(question.clone());
    }
    response
}

/// Synthesized SOA for negative responses, so resolvers can cache them.
fn soa_record(request: &Message, ttl: u32) -> Record {
    let owner = request
        .queries()
        .first()
        .map_or_else(Name::root, |q| q.name().clone());
    let mname = Name::from_str("fake-for-negative-caching.dnsgate.").expect("static name");
    let rname = Name::from_str("hostmaster.dnsgate.").expect("static name");
    Record::from_rdata(
        owner,
        ttl,
        RData::SOA(SOA::new(mname, rname, 100_500, 1800, 900, 604_800, 86_400)),
    )
}

fn answer_record(request: &Message, ttl: u32, rdata: RData) -> Record {
    let owner = request
        .queries()
        .first()
        .map_or_else(Name::root, |q| q.name().clone());
    Record::from_rdata(owner, ttl, rdata)
}

fn soa_response(request: &Message, rcode: ResponseCode, ttl: u32) -> Message {
    let mut response = response_skeleton(request, rcode);
    response.add_name_server(soa_record(request, ttl));
    response
}

fn address_response(request: &Message, ttl: u32, ip: IpAddr) -> Message {
    let mut response = response_skeleton(request, ResponseCode::NoError);
    let rdata = match ip {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    response.add_answer(answer_record(request, ttl, rdata));
    response
}

fn query_type(request: &Message) -> RecordType {
    request
        .queries()
        .first()
        .map_or(RecordType::A, hickory_proto::op::Query::query_type)
}

/// The address answered in `address` mode for this query type, or `None`
/// when the response should be a bare NOERROR with a SOA.
///
/// When a custom blocking address is configured for either family, only
/// families with a custom address get an answer; with no custom addresses
/// both families answer the unspecified address.
fn address_mode_answer(qtype: RecordType, settings: &BlockingSettings) -> Option<IpAddr> {
    let any_custom = settings.custom_ipv4.is_some() || settings.custom_ipv6.is_some();
    match qtype {
        RecordType::A => settings.custom_ipv4.map(IpAddr::V4).or_else(|| {
            (!any_custom).then(|| IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        }),
        RecordType::AAAA => settings.custom_ipv6.map(IpAddr::V6).or_else(|| {
            (!any_custom).then(|| IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        }),
        _ => None,
    }
}

fn mode_response(request: &Message, mode: BlockingMode, settings: &BlockingSettings) -> Message {
    match mode {
        BlockingMode::Refused => response_skeleton(request, ResponseCode::Refused),
        BlockingMode::Nxdomain => {
            soa_response(request, ResponseCode::NXDomain, settings.blocked_ttl)
        }
        BlockingMode::Address => match address_mode_answer(query_type(request), settings) {
            Some(ip) => address_response(request, settings.blocked_ttl, ip),
            None => soa_response(request, ResponseCode::NoError, settings.blocked_ttl),
        },
    }
}

/// Synthesize the response for a blocking decision.
///
/// A hosts rule carrying a concrete address always answers that address for
/// the matching family, whatever the blocking mode; loopback and unspecified
/// addresses in hosts rules are placeholders and follow the mode instead.
#[must_use]
pub fn blocked_response(request: &Message, rule: &Rule, settings: &BlockingSettings) -> Message {
    match &rule.body {
        RuleBody::Hosts { ip } if !is_placeholder_address(*ip) => {
            let qtype = query_type(request);
            let family_matches = matches!(
                (qtype, ip),
                (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_))
            );
            if family_matches {
                address_response(request, settings.blocked_ttl, *ip)
            } else {
                soa_response(request, ResponseCode::NoError, settings.blocked_ttl)
            }
        }
        RuleBody::Hosts { .. } => mode_response(request, settings.hosts_mode, settings),
        RuleBody::Adblock { .. } => mode_response(request, settings.adblock_mode, settings),
    }
}

/// Loopback and unspecified addresses in hosts rules mean "block" rather
/// than "answer me".
fn is_placeholder_address(ip: IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}

/// Response materialized from `$dnsrewrite` rules.
pub struct RewrittenResponse {
    pub response: Message,
    /// Target of a CNAME rewrite; the caller resolves it and appends the
    /// answers.
    pub resolve_cname: Option<Name>,
}

/// Union every non-exception rewrite into one response. A non-NOERROR
/// rewrite wins over record rewrites.
#[must_use]
pub fn rewritten_response(request: &Message, rules: &[Rule], ttl: u32) -> RewrittenResponse {
    let blocking: Vec<&Rule> = rules
        .iter()
        .filter(|r| !r.is_exception() && r.props.contains(RuleProps::DNSREWRITE))
        .collect();

    if let Some(rcode) = blocking
        .iter()
        .filter_map(|r| r.rewrite().map(|rewrite| rewrite.rcode))
        .find(|rcode| *rcode != ResponseCode::NoError)
    {
        return RewrittenResponse {
            response: response_skeleton(request, rcode),
            resolve_cname: None,
        };
    }

    let mut response = response_skeleton(request, ResponseCode::NoError);
    let mut resolve_cname = None;
    for rule in blocking {
        let Some(value) = rule.rewrite().and_then(|rewrite| rewrite.value.as_ref()) else {
            continue;
        };
        let rdata = match value {
            RewriteValue::A(v4) => RData::A(A(*v4)),
            RewriteValue::Aaaa(v6) => RData::AAAA(AAAA(*v6)),
            RewriteValue::Cname(name) => {
                if resolve_cname.is_none() {
                    resolve_cname = Some(name.clone());
                }
                RData::CNAME(CNAME(name.clone()))
            }
            RewriteValue::Mx(preference, exchange) => {
                RData::MX(MX::new(*preference, exchange.clone()))
            }
            RewriteValue::Txt(text) => RData::TXT(TXT::new(vec![text.clone()])),
            RewriteValue::Ptr(name) => RData::PTR(PTR(name.clone())),
        };
        response.add_answer(answer_record(request, ttl, rdata));
    }

    RewrittenResponse {
        response,
        resolve_cname,
    }
}

/// SERVFAIL synthesized when every upstream failed.
#[must_use]
pub fn servfail_response(request: &Message) -> Message {
    response_skeleton(request, ResponseCode::ServFail)
}

const DNSSEC_RECORD_TYPES: [RecordType; 5] = [
    RecordType::RRSIG,
    RecordType::NSEC,
    RecordType::NSEC3,
    RecordType::DNSKEY,
    RecordType::DS,
];

/// Whether the answer section carries DNSSEC signatures.
#[must_use]
pub fn has_dnssec_records(response: &Message) -> bool {
    response
        .answers()
        .iter()
        .any(|record| record.record_type() == RecordType::RRSIG)
}

/// Remove DNSSEC record types from the answer and authority sections.
/// Answer records of the question's own type survive, so a direct DS or
/// RRSIG query still gets its answer.
pub fn scrub_dnssec_records(response: &mut Message, qtype: RecordType) {
    let answers = response
        .take_answers()
        .into_iter()
        .filter(|record| {
            record.record_type() == qtype || !DNSSEC_RECORD_TYPES.contains(&record.record_type())
        })
        .collect();
    response.insert_answers(answers);

    let authority = response
        .take_name_servers()
        .into_iter()
        .filter(|record| !DNSSEC_RECORD_TYPES.contains(&record.record_type()))
        .collect();
    response.insert_name_servers(authority);
}

/// Embed an IPv4 address into a DNS64 prefix per RFC 6052 §2.2.
#[must_use]
pub fn embed_ipv4(prefix: &Ipv6Net, addr: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.network().octets();
    let v4 = addr.octets();
    match prefix.prefix_len() {
        32 => octets[4..8].copy_from_slice(&v4),
        40 => {
            octets[5..8].copy_from_slice(&v4[..3]);
            octets[9] = v4[3];
        }
        48 => {
            octets[6..8].copy_from_slice(&v4[..2]);
            octets[9..11].copy_from_slice(&v4[2..]);
        }
        56 => {
            octets[7] = v4[0];
            octets[9..12].copy_from_slice(&v4[1..]);
        }
        64 => octets[9..13].copy_from_slice(&v4),
        _ => octets[12..16].copy_from_slice(&v4),
    }
    Ipv6Addr::from(octets)
}

/// AAAA records synthesized from the A answers under every configured
/// prefix. Owner names follow the AAAA question.
#[must_use]
pub fn synthesize_dns64(
    request: &Message,
    a_response: &Message,
    prefixes: &[Ipv6Net],
) -> Vec<Record> {
    let Some(owner) = request.queries().first().map(|q| q.name().clone()) else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for prefix in prefixes {
        for record in a_response.answers() {
            if let Some(a) = record.data().and_then(|d| d.as_a()) {
                records.push(Record::from_rdata(
                    owner.clone(),
                    record.ttl(),
                    RData::AAAA(AAAA(embed_ipv4(prefix, a.0))),
                ));
            }
        }
    }
    records
}

/// The UDP payload size negotiated via EDNS, or 512 without it.
#[must_use]
pub fn max_udp_payload(request: &Message) -> usize {
    request
        .extensions()
        .as_ref()
        .map_or(MAX_UDP_PAYLOAD_NO_EDNS, |edns| {
            usize::from(edns.max_payload()).max(MAX_UDP_PAYLOAD_NO_EDNS)
        })
}

/// Header-and-question-only response with the TC bit set, per RFC 1035.
#[must_use]
pub fn truncated_response(request: &Message) -> Message {
    let mut response = Message::new();
    let mut header = Header::new();
    header.set_id(request.id());
    header.set_message_type(MessageType::Response);
    header.set_op_code(OpCode::Query);
    header.set_truncated(true);
    header.set_response_code(ResponseCode::NoError);
    header.set_recursion_desired(request.recursion_desired());
    header.set_recursion_available(true);
    response.set_header(header);

    for question in request.queries() {
        response.add_query(question.clone());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter;
    use hickory_proto::op::Query;

    fn request(domain: &str, qtype: RecordType) -> Message {
        let mut message = Message::new();
        message.set_id(1234);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(domain).unwrap(), qtype));
        message
    }

    fn settings() -> BlockingSettings {
        BlockingSettings {
            adblock_mode: BlockingMode::Refused,
            hosts_mode: BlockingMode::Address,
            custom_ipv4: None,
            custom_ipv6: None,
            blocked_ttl: 3600,
        }
    }

    fn rule(line: &str) -> Rule {
        filter::parse(line).unwrap()
    }

    fn first_answer_text(response: &Message) -> String {
        response.answers()[0].data().unwrap().to_string()
    }

    #[test]
    fn should_answer_refused_for_adblock_rule_in_refused_mode() {
        let response = blocked_response(
            &request("adb-style.com", RecordType::A),
            &rule("||adb-style.com^"),
            &settings(),
        );
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert!(response.answers().is_empty());
        assert!(response.name_servers().is_empty());
        assert_eq!(response.id(), 1234);
    }

    #[test]
    fn should_answer_nxdomain_with_soa() {
        let mut s = settings();
        s.adblock_mode = BlockingMode::Nxdomain;
        let response = blocked_response(
            &request("adb-style.com", RecordType::A),
            &rule("||adb-style.com^"),
            &s,
        );
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers().len(), 1);
        assert_eq!(
            response.name_servers()[0].record_type(),
            RecordType::SOA
        );
    }

    #[test]
    fn should_answer_unspecified_address_by_default_in_address_mode() {
        let mut s = settings();
        s.adblock_mode = BlockingMode::Address;
        let response = blocked_response(
            &request("adb-style.com", RecordType::A),
            &rule("||adb-style.com^"),
            &s,
        );
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(first_answer_text(&response), "0.0.0.0");

        let response = blocked_response(
            &request("adb-style.com", RecordType::AAAA),
            &rule("||adb-style.com^"),
            &s,
        );
        assert_eq!(first_answer_text(&response), "::");
    }

    #[test]
    fn should_answer_custom_addresses_when_configured() {
        let mut s = settings();
        s.adblock_mode = BlockingMode::Address;
        s.custom_ipv4 = Some("4.3.2.1".parse().unwrap());
        s.custom_ipv6 = Some("43::21".parse().unwrap());

        let response = blocked_response(
            &request("adb-style.com", RecordType::A),
            &rule("||adb-style.com^"),
            &s,
        );
        assert_eq!(first_answer_text(&response), "4.3.2.1");

        let response = blocked_response(
            &request("adb-style.com", RecordType::AAAA),
            &rule("||adb-style.com^"),
            &s,
        );
        assert_eq!(first_answer_text(&response), "43::21");
    }

    #[test]
    fn should_answer_soa_for_family_without_custom_address() {
        let mut s = settings();
        s.adblock_mode = BlockingMode::Address;
        s.custom_ipv4 = Some("4.3.2.1".parse().unwrap());

        let response = blocked_response(
            &request("adb-style.com", RecordType::AAAA),
            &rule("||adb-style.com^"),
            &s,
        );
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers().len(), 1);
    }

    #[test]
    fn should_answer_soa_for_other_query_types_in_address_mode() {
        let mut s = settings();
        s.adblock_mode = BlockingMode::Address;
        let response = blocked_response(
            &request("adb-style.com", RecordType::TXT),
            &rule("||adb-style.com^"),
            &s,
        );
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers().len(), 1);
    }

    #[test]
    fn should_treat_hosts_loopback_as_unspecified() {
        let response = blocked_response(
            &request("hosts-style-loopback.com", RecordType::A),
            &rule("127.0.0.1 hosts-style-loopback.com"),
            &settings(),
        );
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(first_answer_text(&response), "0.0.0.0");

        let response = blocked_response(
            &request("hosts-style-loopback-6.com", RecordType::AAAA),
            &rule("::1 hosts-style-loopback-6.com"),
            &settings(),
        );
        assert_eq!(first_answer_text(&response), "::");
    }

    #[test]
    fn should_always_answer_concrete_hosts_address_for_matching_family() {
        let mut s = settings();
        s.hosts_mode = BlockingMode::Refused; // mode must not matter

        let response = blocked_response(
            &request("hosts-style-custom.com", RecordType::A),
            &rule("1.2.3.4 hosts-style-custom.com"),
            &s,
        );
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(first_answer_text(&response), "1.2.3.4");
    }

    #[test]
    fn should_answer_soa_for_concrete_hosts_address_of_other_family() {
        let response = blocked_response(
            &request("hosts-style-custom.com", RecordType::AAAA),
            &rule("1.2.3.4 hosts-style-custom.com"),
            &settings(),
        );
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(response.name_servers().len(), 1);
    }

    #[test]
    fn should_follow_hosts_mode_for_placeholder_addresses() {
        let mut s = settings();
        s.hosts_mode = BlockingMode::Refused;
        let response = blocked_response(
            &request("hosts-style-unspec.com", RecordType::A),
            &rule("0.0.0.0 hosts-style-unspec.com"),
            &s,
        );
        assert_eq!(response.response_code(), ResponseCode::Refused);
    }

    #[test]
    fn should_union_rewrites_into_one_response() {
        let rules = vec![
            rule("example.com$dnsrewrite=NOERROR;A;100.200.200.100"),
            rule("example.com$dnsrewrite=NOERROR;MX;42 example.mail"),
            rule("@@example.com$dnsrewrite=1.2.3.4"),
        ];
        let rewritten = rewritten_response(&request("example.com", RecordType::A), &rules, 3600);
        assert_eq!(rewritten.response.response_code(), ResponseCode::NoError);
        assert_eq!(rewritten.response.answers().len(), 2);
        assert!(rewritten.resolve_cname.is_none());
    }

    #[test]
    fn should_let_rcode_rewrite_win() {
        let rules = vec![
            rule("example.com$dnsrewrite=REFUSED"),
            rule("example.com$dnsrewrite=1.2.3.4"),
        ];
        let rewritten = rewritten_response(&request("example.com", RecordType::A), &rules, 3600);
        assert_eq!(rewritten.response.response_code(), ResponseCode::Refused);
        assert!(rewritten.response.answers().is_empty());
    }

    #[test]
    fn should_report_cname_rewrite_target_for_resolution() {
        let rules = vec![rule("example.com$dnsrewrite=target.example.net")];
        let rewritten = rewritten_response(&request("example.com", RecordType::A), &rules, 3600);
        assert_eq!(rewritten.response.answers().len(), 1);
        assert_eq!(
            rewritten.resolve_cname,
            Some(Name::from_str("target.example.net").unwrap())
        );
    }

    #[test]
    fn should_scrub_dnssec_records_except_question_type() {
        let mut response = request("example.org", RecordType::DS);
        response.set_message_type(MessageType::Response);
        let name = Name::from_str("example.org").unwrap();
        response.add_answer(Record::from_rdata(
            name.clone(),
            300,
            RData::DNSSEC(hickory_proto::rr::dnssec::rdata::DNSSECRData::DS(
                hickory_proto::rr::dnssec::rdata::DS::new(
                    12345,
                    hickory_proto::rr::dnssec::Algorithm::RSASHA256,
                    hickory_proto::rr::dnssec::DigestType::SHA256,
                    vec![0xab; 32],
                ),
            )),
        ));
        response.add_answer(Record::from_rdata(
            name.clone(),
            300,
            RData::A(A("1.2.3.4".parse().unwrap())),
        ));

        scrub_dnssec_records(&mut response, RecordType::DS);
        assert_eq!(response.answers().len(), 2); // DS kept: it is the question type

        scrub_dnssec_records(&mut response, RecordType::A);
        assert_eq!(response.answers().len(), 1); // DS gone now
        assert_eq!(response.answers()[0].record_type(), RecordType::A);
    }

    #[test]
    fn should_embed_ipv4_per_rfc6052() {
        let addr: Ipv4Addr = "192.0.2.33".parse().unwrap();
        let cases = [
            ("64:ff9b::/96", "64:ff9b::c000:221"),
            ("2001:db8::/32", "2001:db8:c000:221::"),
            ("2001:db8:122:344::/64", "2001:db8:122:344:c0:2:2100:0"),
        ];
        for (prefix, expected) in cases {
            let prefix: Ipv6Net = prefix.parse().unwrap();
            assert_eq!(
                embed_ipv4(&prefix, addr),
                expected.parse::<Ipv6Addr>().unwrap(),
                "prefix {prefix}"
            );
        }
    }

    #[test]
    fn should_synthesize_aaaa_for_each_prefix_and_answer() {
        let mut a_response = request("ipv4only.example", RecordType::A);
        a_response.set_message_type(MessageType::Response);
        let name = Name::from_str("ipv4only.example").unwrap();
        a_response.add_answer(Record::from_rdata(
            name.clone(),
            60,
            RData::A(A("192.0.2.1".parse().unwrap())),
        ));
        a_response.add_answer(Record::from_rdata(
            name,
            60,
            RData::A(A("192.0.2.2".parse().unwrap())),
        ));

        let prefixes: Vec<Ipv6Net> = vec!["64:ff9b::/96".parse().unwrap()];
        let aaaa_request = request("ipv4only.example", RecordType::AAAA);
        let records = synthesize_dns64(&aaaa_request, &a_response, &prefixes);
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.record_type() == RecordType::AAAA && r.ttl() == 60));
    }

    #[test]
    fn should_read_edns_payload_size() {
        let mut message = request("example.org", RecordType::A);
        assert_eq!(max_udp_payload(&message), 512);

        let mut edns = hickory_proto::op::Edns::new();
        edns.set_max_payload(4096);
        *message.extensions_mut() = Some(edns);
        assert_eq!(max_udp_payload(&message), 4096);
    }

    #[test]
    fn should_build_truncated_response_with_question_only() {
        use hickory_proto::serialize::binary::BinEncodable;

        let req = request("example.org", RecordType::A);
        let response = truncated_response(&req);
        assert!(response.truncated());
        assert_eq!(response.id(), req.id());
        assert_eq!(response.queries().len(), 1);
        assert!(response.answers().is_empty());
        assert!(response.to_bytes().unwrap().len() <= MAX_UDP_PAYLOAD_NO_EDNS);
    }

    #[test]
    fn should_build_servfail_with_question_echo() {
        let response = servfail_response(&request("example.org", RecordType::A));
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.queries().len(), 1);
    }
}
