//! DNS capture and responder.
//!
//! Authoritative for the service domain on UDP and TCP. Each query names
//! a subdomain (the label immediately left of the service domain); the
//! subdomain's zone answers it, the reply goes out, and the query is
//! appended to the subdomain's log. The service-domain apex answers
//! static NS/SOA and records nothing.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{rdata, DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::state::AppState;
use crate::zone::{self, RecordKind};
use trapline_shared::{Interaction, InteractionDetail};

const TCP_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_UDP_PACKET: usize = 4096;

/// UDP listener loop for one port.
pub async fn serve_udp(
    socket: UdpSocket,
    state: AppState,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("dns udp recv failed: {e}");
                        continue;
                    }
                };
                let packet = buf[..len].to_vec();
                let state = state.clone();
                let socket = socket.clone();
                tracker.spawn(async move {
                    if let Some(reply) = process_packet(&state, &packet, peer).await {
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            debug!("dns udp send to {peer} failed: {e}");
                        }
                    }
                });
            }
        }
    }
}

/// TCP listener loop: length-prefixed queries, same logic as UDP.
pub async fn serve_tcp(
    listener: TcpListener,
    state: AppState,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("dns tcp accept failed: {e}");
                        continue;
                    }
                };
                let state = state.clone();
                tracker.spawn(async move {
                    let _ = handle_tcp(stream, peer, state).await;
                });
            }
        }
    }
}

async fn handle_tcp(
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
    state: AppState,
) -> std::io::Result<()> {
    loop {
        let result = timeout(TCP_QUERY_TIMEOUT, async {
            let len = stream.read_u16().await? as usize;
            let mut packet = vec![0u8; len];
            stream.read_exact(&mut packet).await?;
            std::io::Result::Ok(packet)
        })
        .await;

        let packet = match result {
            Ok(Ok(p)) => p,
            _ => return Ok(()),
        };

        match process_packet(&state, &packet, peer).await {
            Some(reply) => {
                timeout(TCP_QUERY_TIMEOUT, async {
                    stream.write_u16(reply.len() as u16).await?;
                    stream.write_all(&reply).await?;
                    stream.flush().await
                })
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
            }
            None => return Ok(()),
        }
    }
}

/// Where a query name lands relative to the service domain.
#[derive(Debug, PartialEq)]
enum QueryTarget {
    /// The service domain itself.
    Apex,
    /// A subdomain, with the query label relative to it.
    Subdomain { sub: String, rel: String },
    /// Outside the service domain.
    Foreign,
}

fn classify_name(name: &str, service_domain: &str) -> QueryTarget {
    let name = name.trim_end_matches('.').to_lowercase();
    let domain = service_domain.trim_end_matches('.').to_lowercase();

    if name == domain {
        return QueryTarget::Apex;
    }
    let Some(prefix) = name.strip_suffix(&format!(".{domain}")) else {
        return QueryTarget::Foreign;
    };
    match prefix.rsplit_once('.') {
        Some((rel, sub)) => QueryTarget::Subdomain {
            sub: sub.to_string(),
            rel: rel.to_string(),
        },
        None => QueryTarget::Subdomain {
            sub: prefix.to_string(),
            rel: String::new(),
        },
    }
}

/// Parse one query, answer it per the owning zone, and record the
/// interaction. Returns the reply bytes, or `None` when the packet is
/// not worth answering.
async fn process_packet(state: &AppState, packet: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
    let query_msg = match Message::from_bytes(packet) {
        Ok(m) => m,
        Err(e) => {
            debug!("unparseable dns packet from {peer}: {e}");
            return None;
        }
    };
    if query_msg.message_type() != MessageType::Query {
        return None;
    }

    if query_msg.queries().len() != 1 {
        return Some(error_reply(&query_msg, ResponseCode::FormErr));
    }
    let query = query_msg.queries()[0].clone();

    if query.query_class() != DNSClass::IN {
        return Some(error_reply(&query_msg, ResponseCode::NotImp));
    }

    let qname = query.name().to_utf8();
    match classify_name(&qname, &state.cfg.service_domain) {
        QueryTarget::Apex => Some(apex_reply(state, &query_msg)),
        QueryTarget::Foreign => Some(error_reply(&query_msg, ResponseCode::Refused)),
        QueryTarget::Subdomain { sub, rel } => {
            let Some(kind) = record_kind_for(query.query_type()) else {
                return Some(error_reply(&query_msg, ResponseCode::NotImp));
            };
            if !state.sessions.exists(&sub).await.unwrap_or(false) {
                return Some(error_reply(&query_msg, ResponseCode::NXDomain));
            }

            let records = state.zone.get(&sub).await.unwrap_or_default();
            let answer = zone::resolve(&records, &rel, kind);

            let (reply_bytes, reply_text) = match &answer {
                Some(a) => match build_answer(&query_msg, query.name(), kind, a) {
                    Some(bytes) => (bytes, Some(a.value.clone())),
                    None => (error_reply(&query_msg, ResponseCode::ServFail), None),
                },
                None => (error_reply(&query_msg, ResponseCode::NXDomain), None),
            };

            // Reply first, record after: storage must never delay the wire.
            let ip = peer.ip().to_string();
            let interaction = Interaction::new(
                &sub,
                packet,
                ip.clone(),
                peer.port(),
                state.country_for(&ip),
                InteractionDetail::Dns {
                    query_type: kind.as_str().to_string(),
                    domain: qname.trim_end_matches('.').to_string(),
                    reply: reply_text.clone().or_else(|| Some("NXDOMAIN".to_string())),
                },
            );
            state.record(interaction).await;

            Some(reply_bytes)
        }
    }
}

fn record_kind_for(qtype: RecordType) -> Option<RecordKind> {
    match qtype {
        RecordType::A => Some(RecordKind::A),
        RecordType::AAAA => Some(RecordKind::AAAA),
        RecordType::CNAME => Some(RecordKind::CNAME),
        RecordType::TXT => Some(RecordKind::TXT),
        _ => None,
    }
}

fn response_skeleton(query_msg: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(query_msg.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true)
        .set_recursion_desired(query_msg.recursion_desired())
        .set_recursion_available(false);
    for q in query_msg.queries() {
        msg.add_query(q.clone());
    }
    msg
}

fn error_reply(query_msg: &Message, code: ResponseCode) -> Vec<u8> {
    let mut msg = response_skeleton(query_msg);
    msg.set_response_code(code);
    msg.to_vec().unwrap_or_default()
}

/// Static NS/SOA for the service domain itself; nothing is recorded.
fn apex_reply(state: &AppState, query_msg: &Message) -> Vec<u8> {
    let domain = state.cfg.service_domain.trim_end_matches('.');
    let mut msg = response_skeleton(query_msg);
    msg.set_response_code(ResponseCode::NoError);

    let query = &query_msg.queries()[0];
    let apex = match Name::from_utf8(format!("{domain}.")) {
        Ok(n) => n,
        Err(_) => return msg.to_vec().unwrap_or_default(),
    };
    let ttl = state.cfg.dns_default_ttl;

    match query.query_type() {
        RecordType::NS => {
            for ns in ["ns1", "ns2"] {
                if let Ok(name) = Name::from_utf8(format!("{ns}.{domain}.")) {
                    msg.add_answer(Record::from_rdata(
                        apex.clone(),
                        ttl,
                        RData::NS(rdata::NS(name)),
                    ));
                }
            }
        }
        RecordType::SOA => {
            if let (Ok(mname), Ok(rname)) = (
                Name::from_utf8(format!("ns1.{domain}.")),
                Name::from_utf8(format!("hostmaster.{domain}.")),
            ) {
                let soa = rdata::SOA::new(mname, rname, 1, 7200, 900, 1209600, ttl);
                msg.add_answer(Record::from_rdata(apex, ttl, RData::SOA(soa)));
            }
        }
        _ => {}
    }
    msg.to_vec().unwrap_or_default()
}

fn build_answer(
    query_msg: &Message,
    name: &Name,
    kind: RecordKind,
    answer: &zone::Answer,
) -> Option<Vec<u8>> {
    let rdata = match kind {
        RecordKind::A => RData::A(answer.value.parse::<Ipv4Addr>().ok()?.into()),
        RecordKind::AAAA => RData::AAAA(answer.value.parse::<Ipv6Addr>().ok()?.into()),
        RecordKind::CNAME => {
            let target = format!("{}.", answer.value.trim_end_matches('.'));
            RData::CNAME(rdata::CNAME(Name::from_utf8(target).ok()?))
        }
        RecordKind::TXT => RData::TXT(rdata::TXT::new(chunk_txt(&answer.value))),
    };

    let mut msg = response_skeleton(query_msg);
    msg.set_response_code(ResponseCode::NoError);
    msg.add_answer(Record::from_rdata(name.clone(), answer.ttl, rdata));
    msg.to_vec().ok()
}

/// TXT character-strings carry at most 255 bytes; longer values are
/// chunked on the wire.
fn chunk_txt(value: &str) -> Vec<String> {
    let bytes = value.as_bytes();
    if bytes.is_empty() {
        return vec![String::new()];
    }
    bytes
        .chunks(255)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::MemoryStore;
    use crate::zone::DnsRecord;
    use hickory_proto::op::Query;

    fn test_state() -> AppState {
        let mut cfg = Config::default();
        cfg.signing.active = "k".into();
        cfg.signing.keys.insert("k".into(), "secret".into());
        AppState::new(cfg, std::sync::Arc::new(MemoryStore::new(64))).unwrap()
    }

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_utf8(name).unwrap(), qtype));
        msg
    }

    fn peer() -> SocketAddr {
        "203.0.113.9:5353".parse().unwrap()
    }

    #[test]
    fn test_classify_name() {
        let d = "trapline.test";
        assert_eq!(classify_name("trapline.test.", d), QueryTarget::Apex);
        assert_eq!(
            classify_name("abc123.trapline.test.", d),
            QueryTarget::Subdomain {
                sub: "abc123".into(),
                rel: "".into()
            }
        );
        assert_eq!(
            classify_name("foo.bar.abc123.trapline.test", d),
            QueryTarget::Subdomain {
                sub: "abc123".into(),
                rel: "foo.bar".into()
            }
        );
        assert_eq!(classify_name("other.example.", d), QueryTarget::Foreign);
    }

    #[test]
    fn test_chunk_txt() {
        assert_eq!(chunk_txt("short"), vec!["short".to_string()]);
        let long = "x".repeat(600);
        let chunks = chunk_txt(&long);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 255);
        assert_eq!(chunks[2].len(), 90);
    }

    #[tokio::test]
    async fn test_wildcard_answer_and_capture() {
        let state = test_state();
        state.sessions.create(Some("abc123")).await.unwrap();
        state
            .zone
            .put(
                "abc123",
                &[DnsRecord {
                    domain: "*".into(),
                    kind: RecordKind::A,
                    value: "1.2.3.4".into(),
                    ttl: 60,
                }],
            )
            .await
            .unwrap();

        let q = query("foo.abc123.trapline.test.", RecordType::A);
        let reply = process_packet(&state, &q.to_vec().unwrap(), peer())
            .await
            .unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();
        assert_eq!(parsed.id(), 4242);
        assert_eq!(parsed.response_code(), ResponseCode::NoError);
        assert_eq!(parsed.answers().len(), 1);
        match parsed.answers()[0].data() {
            RData::A(a) => assert_eq!(a.0, "1.2.3.4".parse::<Ipv4Addr>().unwrap()),
            other => panic!("unexpected rdata {other:?}"),
        }

        let page = state.log.list("abc123", 10, 0).await.unwrap();
        assert_eq!(page.items.len(), 1);
        match &page.items[0].detail {
            InteractionDetail::Dns {
                query_type,
                domain,
                reply,
            } => {
                assert_eq!(query_type, "A");
                assert_eq!(domain, "foo.abc123.trapline.test");
                assert_eq!(reply.as_deref(), Some("1.2.3.4"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_nxdomain_recorded() {
        let state = test_state();
        state.sessions.create(Some("abc123")).await.unwrap();

        let q = query("abc123.trapline.test.", RecordType::A);
        let reply = process_packet(&state, &q.to_vec().unwrap(), peer())
            .await
            .unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();
        assert_eq!(parsed.response_code(), ResponseCode::NXDomain);

        let page = state.log.list("abc123", 10, 0).await.unwrap();
        assert_eq!(page.items.len(), 1);
        match &page.items[0].detail {
            InteractionDetail::Dns { reply, .. } => {
                assert_eq!(reply.as_deref(), Some("NXDOMAIN"))
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_dead_subdomain_not_recorded() {
        let state = test_state();
        let q = query("nosess.trapline.test.", RecordType::A);
        let reply = process_packet(&state, &q.to_vec().unwrap(), peer())
            .await
            .unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();
        assert_eq!(parsed.response_code(), ResponseCode::NXDomain);
        let page = state.log.list("nosess", 10, 0).await.unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_type_notimp() {
        let state = test_state();
        state.sessions.create(Some("abc123")).await.unwrap();
        let q = query("abc123.trapline.test.", RecordType::MX);
        let reply = process_packet(&state, &q.to_vec().unwrap(), peer())
            .await
            .unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();
        assert_eq!(parsed.response_code(), ResponseCode::NotImp);
    }

    #[tokio::test]
    async fn test_apex_ns_and_nothing_recorded() {
        let state = test_state();
        let q = query("trapline.test.", RecordType::NS);
        let reply = process_packet(&state, &q.to_vec().unwrap(), peer())
            .await
            .unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();
        assert_eq!(parsed.response_code(), ResponseCode::NoError);
        assert_eq!(parsed.answers().len(), 2);
    }

    #[tokio::test]
    async fn test_txt_answer() {
        let state = test_state();
        state.sessions.create(Some("abc123")).await.unwrap();
        state
            .zone
            .put(
                "abc123",
                &[DnsRecord {
                    domain: "".into(),
                    kind: RecordKind::TXT,
                    value: "v=spf1 -all".into(),
                    ttl: 120,
                }],
            )
            .await
            .unwrap();

        let q = query("abc123.trapline.test.", RecordType::TXT);
        let reply = process_packet(&state, &q.to_vec().unwrap(), peer())
            .await
            .unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();
        assert_eq!(parsed.answers().len(), 1);
        assert_eq!(parsed.answers()[0].ttl(), 120);
        match parsed.answers()[0].data() {
            RData::TXT(txt) => {
                let joined: Vec<u8> = txt
                    .txt_data()
                    .iter()
                    .flat_map(|c| c.iter().copied())
                    .collect();
                assert_eq!(joined, b"v=spf1 -all");
            }
            other => panic!("unexpected rdata {other:?}"),
        }
    }
}
