//! Shared test infrastructure for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use hickory_server::authority::{MessageRequest, MessageResponse, MessageResponseBuilder};
use hickory_server::proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_server::proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_server::proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::server::{Protocol, Request, RequestHandler, ResponseHandler, ResponseInfo};
use tokio::sync::mpsc;

use docker_dns::cloudflare::{
    DnsRecord, DnsRecordApi, IngressRule, RecordFilter, TunnelConfigApi, TunnelConfiguration,
};
use docker_dns::error::ProviderError;
use docker_dns::runtime::ContainerRuntime;
use docker_dns::types::{Container, LifecycleEvent, NetworkAttachment};

// --- MockCloudflare ---

#[derive(Default)]
struct MockState {
    /// zone id -> records
    records: HashMap<String, Vec<DnsRecord>>,
    ingress: Vec<IngressRule>,
    next_id: u64,
    puts: usize,
    /// Every name or hostname that reached the provider.
    touched: Vec<String>,
}

/// In-memory provider implementing both capability traits.
#[derive(Default)]
pub struct MockCloudflare {
    state: Mutex<MockState>,
}

impl MockCloudflare {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Provider whose tunnel currently holds `ingress`.
    pub fn with_ingress(ingress: Vec<IngressRule>) -> Arc<Self> {
        let mock = Self::default();
        mock.state.lock().unwrap().ingress = ingress;
        Arc::new(mock)
    }

    /// Pre-existing record, as if created out of band.
    pub fn seed_record(&self, zone_id: &str, name: &str, content: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let record = DnsRecord {
            id: format!("seed-{}", state.next_id),
            record_type: "CNAME".into(),
            name: name.into(),
            content: content.into(),
            proxied: Some(false),
            ttl: 1,
        };
        state
            .records
            .entry(zone_id.to_string())
            .or_default()
            .push(record);
    }

    pub fn records(&self, zone_id: &str) -> Vec<DnsRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(zone_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn records_named(&self, zone_id: &str, name: &str) -> Vec<DnsRecord> {
        self.records(zone_id)
            .into_iter()
            .filter(|record| record.name == name)
            .collect()
    }

    pub fn ingress(&self) -> Vec<IngressRule> {
        self.state.lock().unwrap().ingress.clone()
    }

    pub fn ingress_hostnames(&self) -> Vec<String> {
        self.ingress()
            .into_iter()
            .map(|rule| rule.hostname)
            .collect()
    }

    pub fn puts(&self) -> usize {
        self.state.lock().unwrap().puts
    }

    pub fn touched(&self) -> Vec<String> {
        self.state.lock().unwrap().touched.clone()
    }
}

#[async_trait]
impl DnsRecordApi for MockCloudflare {
    async fn list_records(
        &self,
        zone_id: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<DnsRecord>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.touched.push(filter.name.clone());
        Ok(state
            .records
            .get(zone_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.record_type == filter.record_type && r.name == filter.name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_record(
        &self,
        zone_id: &str,
        record: &DnsRecord,
    ) -> Result<DnsRecord, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.touched.push(record.name.clone());
        state.next_id += 1;
        let created = DnsRecord {
            id: format!("rec-{}", state.next_id),
            ..record.clone()
        };
        state
            .records
            .entry(zone_id.to_string())
            .or_default()
            .push(created.clone());
        Ok(created)
    }

    async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &DnsRecord,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.touched.push(record.name.clone());
        let stored = state
            .records
            .get_mut(zone_id)
            .and_then(|records| records.iter_mut().find(|r| r.id == record_id))
            .ok_or_else(|| ProviderError::RecordNotFound(record_id.to_string()))?;
        *stored = DnsRecord {
            id: record_id.to_string(),
            ..record.clone()
        };
        Ok(())
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        let records = state.records.entry(zone_id.to_string()).or_default();
        let before = records.len();
        records.retain(|r| r.id != record_id);
        if records.len() == before {
            return Err(ProviderError::RecordNotFound(record_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelConfigApi for MockCloudflare {
    async fn get_tunnel_config(
        &self,
        _account_id: &str,
        _tunnel_id: &str,
    ) -> Result<TunnelConfiguration, ProviderError> {
        Ok(TunnelConfiguration {
            ingress: self.state.lock().unwrap().ingress.clone(),
            ..Default::default()
        })
    }

    async fn put_tunnel_config(
        &self,
        _account_id: &str,
        _tunnel_id: &str,
        config: &TunnelConfiguration,
    ) -> Result<TunnelConfiguration, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let hostnames: Vec<String> = config
            .ingress
            .iter()
            .filter(|rule| !rule.is_catch_all())
            .map(|rule| rule.hostname.clone())
            .collect();
        state.touched.extend(hostnames);
        state.ingress = config.ingress.clone();
        state.puts += 1;
        Ok(config.clone())
    }
}

// --- StaticRuntime ---

/// Runtime serving a fixed inventory; `monitor` replays every scan as
/// `Started` events closed by `Synced`, as a reconnecting runtime would.
#[derive(Default)]
pub struct StaticRuntime {
    scans: Vec<Vec<Container>>,
}

impl StaticRuntime {
    pub fn new(containers: Vec<Container>) -> Arc<Self> {
        Self::rescanned(vec![containers])
    }

    /// One scan per (re)connect; the last one is the current inventory.
    pub fn rescanned(scans: Vec<Vec<Container>>) -> Arc<Self> {
        Arc::new(Self { scans })
    }

    fn current(&self) -> &[Container] {
        self.scans.last().map(Vec::as_slice).unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for StaticRuntime {
    async fn monitor(&self, event_tx: mpsc::Sender<LifecycleEvent>) -> anyhow::Result<()> {
        for scan in &self.scans {
            for container in scan {
                event_tx
                    .send(LifecycleEvent::Started(container.clone()))
                    .await
                    .map_err(|_| anyhow!("Channel closed"))?;
            }
            let running = scan.iter().map(|c| c.id.clone()).collect();
            event_tx
                .send(LifecycleEvent::Synced { running })
                .await
                .map_err(|_| anyhow!("Channel closed"))?;
        }
        Err(anyhow!("event stream closed"))
    }

    async fn inspect(&self, id: &str) -> anyhow::Result<Container> {
        self.current()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| anyhow!("no such container: {}", id))
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.current().iter().map(|c| c.id.clone()).collect())
    }
}

// --- Container builders ---

pub struct ContainerBuilder {
    container: Container,
}

impl ContainerBuilder {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            container: Container {
                id: id.to_string(),
                name: name.to_string(),
                hostname: name.to_string(),
                network_mode: "bridge".into(),
                ..Default::default()
            },
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.container
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.container.ip_address = Some(ip.parse().unwrap());
        self
    }

    pub fn ipv6(mut self, ip: &str) -> Self {
        self.container.global_ipv6_address = Some(ip.parse().unwrap());
        self
    }

    pub fn network(mut self, name: &str, ip: &str, aliases: &[&str]) -> Self {
        self.container.networks.insert(
            name.to_string(),
            NetworkAttachment {
                ip_address: Some(ip.parse().unwrap()),
                global_ipv6_address: None,
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
            },
        );
        self
    }

    pub fn traefik_rule(self, router: &str, rule: &str) -> Self {
        self.label(&format!("traefik.http.routers.{}.rule", router), rule)
    }

    pub fn build(self) -> Container {
        self.container
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn domains(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// --- Polling ---

/// Re-evaluates `check` until it holds; fire-and-forget work lands on
/// other tasks.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Synchronous flavour of [`eventually`] for checks against the mocks.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Next handler stub ---

/// Stands in for the forwarder: answers REFUSED so fallthrough is visible.
#[derive(Clone, Default)]
pub struct RefusingNext;

#[async_trait]
impl RequestHandler for RefusingNext {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let mut header = Header::response_from_request(request.header());
        header.set_response_code(ResponseCode::Refused);
        let response = MessageResponseBuilder::from_message_request(request).build_no_records(header);
        response_handle
            .send_response(response)
            .await
            .expect("failed to send fallthrough response")
    }
}

// --- Query/Request construction ---

/// Build a `Request` for `name` as a UDP client would send it.
pub fn build_request(name: &str, record_type: RecordType, class: DNSClass) -> Request {
    let mut msg = Message::new();
    msg.set_id(4242);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(class);
    msg.add_query(query);

    let bytes = msg.to_vec().unwrap();
    let mut decoder = BinDecoder::new(&bytes);
    let request = MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest");
    let src: SocketAddr = "10.0.0.1:12345".parse().unwrap();
    Request::new(request, src, Protocol::Udp)
}

/// Run one IN-class query through `handler` and return the parsed response.
pub async fn execute_query<H: RequestHandler>(
    handler: &H,
    name: &str,
    record_type: RecordType,
) -> Message {
    let request = build_request(name, record_type, DNSClass::IN);
    let response = TestResponseHandler::new();
    handler.handle_request(&request, response.clone()).await;
    response.into_message()
}

// --- Response helpers ---

pub fn a_records(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect()
}

pub fn aaaa_records(msg: &Message) -> Vec<Ipv6Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::AAAA(aaaa)) => Some(aaaa.0),
            _ => None,
        })
        .collect()
}

pub fn cname_targets(msg: &Message) -> Vec<String> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::CNAME(cname)) => Some(cname.0.to_ascii()),
            _ => None,
        })
        .collect()
}
