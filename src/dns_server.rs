//! DNS server subsystem.
//!
//! [`DockerDns`] answers A, AAAA and CNAME queries for names found in the
//! [`ContainerRegistry`].  Anything it does not know is handed to the next
//! handler, normally a [`Forwarder`] backed by `hickory-resolver`, so the
//! daemon can sit in front of clients as their only resolver.
//!
//! * **Plain names** answer with the container's own address.  A name
//!   known only with IPv4 answers AAAA with an empty NOERROR (NODATA).
//! * **Redirect names** answer with the configured redirect target: a
//!   CNAME for every query type, or a fixed IPv4 address for A queries
//!   only.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA, CNAME};
use hickory_server::proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_server::server::{
    Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture,
};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;

use crate::registry::ContainerRegistry;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// TTL used when none is configured.
pub const DEFAULT_TTL: u32 = 3600;

/// Where redirect names point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    /// Answer with a CNAME to this host.
    Cname(Name),
    /// Answer A queries with this address; AAAA is never synthesized.
    A(Ipv4Addr),
}

/// Outcome of consulting the registry for one question.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Records(Vec<Record>),
    /// The name is known but has no data of this type.
    NoData,
    /// Not ours, ask the next handler.
    Fallthrough,
}

/// Start the DNS server on UDP and TCP.
pub async fn run_dns_server<H>(bind_addr: SocketAddr, handler: H) -> anyhow::Result<()>
where
    H: RequestHandler,
{
    info!("DNS server starting on {}", bind_addr);

    let mut server = ServerFuture::new(handler);

    let udp = UdpSocket::bind(bind_addr).await?;
    server.register_socket(udp);

    let tcp = TcpListener::bind(bind_addr).await?;
    server.register_listener(tcp, TCP_TIMEOUT);

    server.block_until_done().await?;
    Ok(())
}

pub struct DockerDns<N> {
    registry: Arc<ContainerRegistry>,
    ttl: u32,
    redirect: Option<RedirectTarget>,
    next: N,
}

impl<N: RequestHandler> DockerDns<N> {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        ttl: u32,
        redirect: Option<RedirectTarget>,
        next: N,
    ) -> Self {
        Self {
            registry,
            ttl,
            redirect,
            next,
        }
    }

    /// Looks `name` up once and applies the record type rules.
    pub async fn answer(&self, name: &Name, qtype: RecordType) -> Answer {
        if !matches!(qtype, RecordType::A | RecordType::AAAA | RecordType::CNAME) {
            return Answer::Fallthrough;
        }

        let Some(hit) = self.registry.lookup_by_name(&name.to_ascii()).await else {
            return Answer::Fallthrough;
        };

        let rdata = if hit.is_redirect {
            match (&self.redirect, qtype) {
                (Some(RedirectTarget::Cname(target)), _) => RData::CNAME(CNAME(target.clone())),
                (Some(RedirectTarget::A(ip)), RecordType::A) => RData::A(A(*ip)),
                _ => return Answer::Fallthrough,
            }
        } else {
            let entry = &hit.entry;
            match (qtype, entry.ipv4, entry.ipv6) {
                (RecordType::A, Some(ip), _) => RData::A(A(ip)),
                (RecordType::AAAA, _, Some(ip)) => RData::AAAA(AAAA(ip)),
                (RecordType::AAAA, Some(_), None) => return Answer::NoData,
                _ => return Answer::Fallthrough,
            }
        };

        debug!(
            "Answering {} {} from container {}",
            qtype,
            name,
            hit.entry.container.short_id()
        );
        Answer::Records(vec![Record::from_rdata(name.clone(), self.ttl, rdata)])
    }
}

#[async_trait]
impl<N: RequestHandler> RequestHandler for DockerDns<N> {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = request.query();
        if query.query_class() != DNSClass::IN {
            return self.next.handle_request(request, response_handle).await;
        }

        // Keep the client's spelling of the name in the answer.
        let name = query.original().name().clone();
        let records = match self.answer(&name, query.query_type()).await {
            Answer::Fallthrough => return self.next.handle_request(request, response_handle).await,
            Answer::NoData => Vec::new(),
            Answer::Records(records) => records,
        };

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_recursion_available(false);
        header.set_response_code(ResponseCode::NoError);

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            records.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Error sending response for {}: {}", name, e);
                server_failure(request)
            }
        }
    }
}

/// Next handler forwarding to upstream resolvers.
pub struct Forwarder {
    resolver: TokioAsyncResolver,
}

impl Forwarder {
    /// Uses `upstreams` when given, the system configuration otherwise.
    pub fn new(upstreams: &[SocketAddr]) -> anyhow::Result<Self> {
        let resolver = if upstreams.is_empty() {
            TokioAsyncResolver::tokio_from_system_conf()?
        } else {
            let mut config = ResolverConfig::new();
            for addr in upstreams {
                config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
                config.add_name_server(NameServerConfig::new(*addr, Protocol::Tcp));
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        };
        Ok(Self { resolver })
    }
}

#[async_trait]
impl RequestHandler for Forwarder {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = request.query();
        let name: Name = query.name().clone().into();
        let qtype = query.query_type();

        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        let records: Vec<Record> = match self.resolver.lookup(name.clone(), qtype).await {
            Ok(lookup) => lookup.record_iter().cloned().collect(),
            Err(e) => {
                let code = match e.kind() {
                    ResolveErrorKind::NoRecordsFound { response_code, .. } => *response_code,
                    _ => {
                        warn!("Resolver lookup failed for {}: {}", name, e);
                        ResponseCode::ServFail
                    }
                };
                header.set_response_code(code);
                Vec::new()
            }
        };

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            records.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Error forwarding response for {}: {}", name, e);
                server_failure(request)
            }
        }
    }
}

fn server_failure(request: &Request) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}
