//! UDP DNS server.
//!
//! Per datagram: parse the query, identify the client, consult the
//! decision cache, ask the engine, then either synthesize a block or
//! rewrite answer or forward upstream (with its own cache). Upstream
//! failure answers SERVFAIL and is never cached.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use hickory_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{rdata, Name, RData, Record, RecordType},
};
use time::Duration;
use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    cache::TtlCache,
    engine::{Engine, ResolveResult},
    mac::MacResolver,
    rules::normalize_name,
    shutdown::Shutdown,
};

/// TTL on synthesized block answers (A `0.0.0.0` / AAAA `::`).
const BLOCK_TTL: u32 = 60;
/// TTL on synthesized rewrite answers.
const REWRITE_TTL: u32 = 20;
/// Decision-cache lifetime.
const DECISION_CACHE_TTL: Duration = Duration::seconds(20);
/// Bounds on the upstream-cache lifetime derived from response records.
const UPSTREAM_TTL_FLOOR: i64 = 20;
const UPSTREAM_TTL_CEIL: i64 = 1800;
/// Wall-clock limit for one upstream exchange.
const UPSTREAM_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Everything one query needs; cheap to clone into per-packet tasks.
#[derive(Clone)]
pub struct DnsServerDeps {
    pub engine: Arc<Engine>,
    pub mac: Arc<MacResolver>,
    pub decision_cache: Arc<TtlCache>,
    pub upstream_cache: Arc<TtlCache>,
    pub listen: SocketAddr,
    pub upstream: SocketAddr,
}

pub struct DnsServer {
    deps: DnsServerDeps,
}

impl DnsServer {
    pub fn new(deps: DnsServerDeps) -> Self {
        Self { deps }
    }

    /// Serve until shutdown. One task per datagram.
    pub async fn run(self, shutdown: Shutdown) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.deps.listen).await?);
        info!(listen = %self.deps.listen, upstream = %self.deps.upstream, "dns server listening");

        let mut buf = vec![0u8; 65_535];
        loop {
            let (n, peer) = tokio::select! {
                _ = shutdown.wait() => break,
                res = socket.recv_from(&mut buf) => res?,
            };
            let packet = buf[..n].to_vec();
            let socket = socket.clone();
            let deps = self.deps.clone();
            tokio::spawn(async move {
                if let Some(resp) = handle_query(packet, peer, deps).await {
                    if let Err(e) = socket.send_to(&resp, peer).await {
                        warn!(peer = %peer, error = %e, "failed to send response");
                    }
                }
            });
        }
        Ok(())
    }
}

async fn handle_query(packet: Vec<u8>, peer: SocketAddr, deps: DnsServerDeps) -> Option<Vec<u8>> {
    let req = match Message::from_vec(&packet) {
        Ok(m) => m,
        Err(_) => return None,
    };
    let id = req.id();
    let query = req.queries().first()?.clone();
    let qname = query.name().to_utf8();
    let qtype = query.query_type();
    let client_ip = peer.ip();
    let client_mac = deps.mac.resolve(client_ip);

    // The decision cache is keyed per user-group label so one client's
    // synthesized answers never leak into another group.
    let group_label = group_label(&deps.engine, client_ip, client_mac.as_deref());
    let name_key = normalize_name(&qname);
    let decision_key = format!("{}:{}:{}", group_label, u16::from(qtype), name_key);

    if let Some(resp) = deps.decision_cache.get(&decision_key, id) {
        debug!(qname = %name_key, group = %group_label, "decision cache hit");
        return Some(resp);
    }

    let decision = deps
        .engine
        .resolve(&qname, qtype, client_ip, client_mac.as_deref());

    if decision.blocked {
        log_decision(&decision, &name_key, client_ip, client_mac.as_deref());
        let resp = build_filtered_response(&req, &query, &decision).ok()?;
        deps.decision_cache
            .put(decision_key, &resp, DECISION_CACHE_TTL);
        return Some(resp);
    }

    debug!(qname = %name_key, client = %client_ip, reason = decision.reason, "allowed");

    let upstream_key = format!("{}:{}", u16::from(qtype), name_key);
    if let Some(resp) = deps.upstream_cache.get(&upstream_key, id) {
        debug!(qname = %name_key, "upstream cache hit");
        return Some(resp);
    }

    match timeout(UPSTREAM_TIMEOUT, forward_udp(deps.upstream, &packet)).await {
        Ok(Ok(resp)) => {
            if let Ok(msg) = Message::from_vec(&resp) {
                deps.upstream_cache
                    .put(upstream_key, &resp, upstream_cache_ttl(&msg));
            }
            Some(resp)
        }
        Ok(Err(e)) => {
            warn!(upstream = %deps.upstream, error = %e, "upstream exchange failed");
            build_failure_response(&req).ok()
        }
        Err(_) => {
            warn!(upstream = %deps.upstream, "upstream exchange timed out");
            build_failure_response(&req).ok()
        }
    }
}

fn group_label(engine: &Engine, ip: IpAddr, mac: Option<&str>) -> String {
    match engine.identify(ip, mac) {
        Some(user) => format!("{} ({})", user.name, user.user_group),
        None => "Default".to_string(),
    }
}

fn log_decision(decision: &ResolveResult, qname: &str, ip: IpAddr, mac: Option<&str>) {
    let rule = decision
        .rule
        .as_ref()
        .map(|r| r.text.as_str())
        .unwrap_or("");
    match &decision.rewrite {
        Some(dest) => {
            info!(qname, client = %ip, rule, dest = %dest, "rewrite");
        }
        None => {
            info!(qname, client = %ip, mac = mac.unwrap_or(""), rule, "block");
        }
    }
}

/// Synthesize the answer for a block or rewrite decision.
///
/// Blocks: A → `0.0.0.0`, AAAA → `::`, anything else an empty
/// authoritative reply. Rewrites: A/AAAA when the destination is an IP
/// of matching family, a CNAME for non-IP destinations on address and
/// CNAME queries.
fn build_filtered_response(
    req: &Message,
    query: &Query,
    decision: &ResolveResult,
) -> anyhow::Result<Vec<u8>> {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(OpCode::Query);
    resp.set_authoritative(true);
    resp.set_recursion_available(true);
    resp.set_recursion_desired(req.recursion_desired());
    resp.set_response_code(ResponseCode::NoError);
    resp.add_query(query.clone());

    let name = query.name().clone();
    let qtype = query.query_type();

    match &decision.rewrite {
        Some(dest) => {
            if let Ok(ip) = dest.parse::<IpAddr>() {
                match (qtype, ip) {
                    (RecordType::A, IpAddr::V4(v4)) => {
                        resp.add_answer(Record::from_rdata(
                            name,
                            REWRITE_TTL,
                            RData::A(rdata::A(v4)),
                        ));
                    }
                    (RecordType::AAAA, IpAddr::V6(v6)) => {
                        resp.add_answer(Record::from_rdata(
                            name,
                            REWRITE_TTL,
                            RData::AAAA(rdata::AAAA(v6)),
                        ));
                    }
                    // Family mismatch: empty answer section.
                    _ => {}
                }
            } else if matches!(
                qtype,
                RecordType::A | RecordType::AAAA | RecordType::CNAME
            ) {
                let target = Name::from_utf8(format!("{dest}."))?;
                resp.add_answer(Record::from_rdata(
                    name,
                    REWRITE_TTL,
                    RData::CNAME(rdata::CNAME(target)),
                ));
            }
        }
        None => match qtype {
            RecordType::A => {
                resp.add_answer(Record::from_rdata(
                    name,
                    BLOCK_TTL,
                    RData::A(rdata::A(std::net::Ipv4Addr::UNSPECIFIED)),
                ));
            }
            RecordType::AAAA => {
                resp.add_answer(Record::from_rdata(
                    name,
                    BLOCK_TTL,
                    RData::AAAA(rdata::AAAA(std::net::Ipv6Addr::UNSPECIFIED)),
                ));
            }
            _ => {}
        },
    }

    Ok(resp.to_vec()?)
}

/// SERVFAIL with the request's queries echoed back.
fn build_failure_response(req: &Message) -> anyhow::Result<Vec<u8>> {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(OpCode::Query);
    resp.set_recursion_available(true);
    resp.set_recursion_desired(req.recursion_desired());
    resp.set_response_code(ResponseCode::ServFail);
    for q in req.queries() {
        resp.add_query(q.clone());
    }
    Ok(resp.to_vec()?)
}

async fn forward_udp(upstream: SocketAddr, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(packet, upstream).await?;

    let mut buf = vec![0u8; 65_535];
    let (n, _) = socket.recv_from(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

/// Cache lifetime for an upstream response: the minimum record TTL
/// across all sections, clamped to `[20, 1800]` s; 20 s when the
/// response carries no records.
fn upstream_cache_ttl(msg: &Message) -> Duration {
    let mut min: Option<u32> = None;
    for record in msg
        .answers()
        .iter()
        .chain(msg.name_servers())
        .chain(msg.additionals())
    {
        let ttl = record.ttl();
        min = Some(match min {
            Some(m) => m.min(ttl),
            None => ttl,
        });
    }

    let secs = match min {
        Some(ttl) => (ttl as i64).clamp(UPSTREAM_TTL_FLOOR, UPSTREAM_TTL_CEIL),
        None => UPSTREAM_TTL_FLOOR,
    };
    Duration::seconds(secs)
}
