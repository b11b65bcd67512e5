//! Wire-level answers produced from registry contents.

mod common;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use hickory_server::proto::op::ResponseCode;
use hickory_server::proto::rr::{DNSClass, Name, RecordType};
use hickory_server::server::RequestHandler;

use docker_dns::dns_server::{DockerDns, RedirectTarget};
use docker_dns::reconcile::Reconciler;
use docker_dns::registry::ContainerRegistry;
use docker_dns::resolvers::{ContainerNameResolver, ResolverChain, TraefikRuleResolver};

use common::*;

fn chain() -> ResolverChain {
    ResolverChain::new()
        .with_plain(ContainerNameResolver {
            domain: "docker.loc".into(),
        })
        .with_redirect(TraefikRuleResolver::new("traefik"))
}

async fn server(redirect: Option<RedirectTarget>) -> DockerDns<RefusingNext> {
    let registry = Arc::new(ContainerRegistry::new(
        chain(),
        StaticRuntime::new(Vec::new()),
        Reconciler::disabled(),
    ));

    registry
        .upsert(ContainerBuilder::new("c1", "web").ip("172.17.0.2").build())
        .await;
    registry
        .upsert(
            ContainerBuilder::new("c2", "dual")
                .ip("172.17.0.3")
                .ipv6("2001:db8::3")
                .build(),
        )
        .await;
    // Its name-derived domain collides with another container's rule.
    registry
        .upsert(
            ContainerBuilder::new("c3", "blog")
                .ip("172.17.0.4")
                .traefik_rule("blog", "Host(`blog.example.org`) || Host(`web.docker.loc`)")
                .build(),
        )
        .await;

    DockerDns::new(registry, 3600, redirect, RefusingNext)
}

fn traefik_cname() -> Option<RedirectTarget> {
    Some(RedirectTarget::Cname(
        Name::from_ascii("traefik.example.org.").unwrap(),
    ))
}

#[tokio::test]
async fn plain_name_answers_a() {
    let dns = server(traefik_cname()).await;
    let msg = execute_query(&dns, "dual.docker.loc.", RecordType::A).await;

    assert_eq!(msg.response_code(), ResponseCode::NoError);
    assert!(msg.authoritative());
    assert!(!msg.recursion_available());
    assert_eq!(a_records(&msg), vec![Ipv4Addr::new(172, 17, 0, 3)]);
    assert_eq!(msg.answers()[0].ttl(), 3600);
}

#[tokio::test]
async fn plain_name_answers_aaaa_when_known() {
    let dns = server(traefik_cname()).await;
    let msg = execute_query(&dns, "dual.docker.loc.", RecordType::AAAA).await;

    assert_eq!(
        aaaa_records(&msg),
        vec!["2001:db8::3".parse::<Ipv6Addr>().unwrap()]
    );
}

#[tokio::test]
async fn ipv4_only_name_answers_aaaa_with_nodata() {
    let dns = server(traefik_cname()).await;
    let msg = execute_query(&dns, "blog.docker.loc.", RecordType::AAAA).await;

    assert_eq!(msg.response_code(), ResponseCode::NoError);
    assert!(msg.authoritative());
    assert!(msg.answers().is_empty());
}

#[tokio::test]
async fn redirect_wins_over_plain_for_a_and_cname() {
    let dns = server(traefik_cname()).await;

    for qtype in [RecordType::A, RecordType::CNAME, RecordType::AAAA] {
        let msg = execute_query(&dns, "web.docker.loc.", qtype).await;
        assert_eq!(msg.response_code(), ResponseCode::NoError, "{}", qtype);
        assert!(a_records(&msg).is_empty(), "{}", qtype);
        assert_eq!(cname_targets(&msg), vec!["traefik.example.org."], "{}", qtype);
    }
}

#[tokio::test]
async fn a_mode_redirect_answers_a_only() {
    let dns = server(Some(RedirectTarget::A(Ipv4Addr::new(192, 0, 2, 10)))).await;

    let msg = execute_query(&dns, "blog.example.org.", RecordType::A).await;
    assert_eq!(a_records(&msg), vec![Ipv4Addr::new(192, 0, 2, 10)]);

    let msg = execute_query(&dns, "blog.example.org.", RecordType::AAAA).await;
    assert_eq!(msg.response_code(), ResponseCode::Refused);

    let msg = execute_query(&dns, "blog.example.org.", RecordType::CNAME).await;
    assert_eq!(msg.response_code(), ResponseCode::Refused);
}

#[tokio::test]
async fn plain_names_do_not_answer_cname() {
    let dns = server(traefik_cname()).await;
    let msg = execute_query(&dns, "dual.docker.loc.", RecordType::CNAME).await;
    assert_eq!(msg.response_code(), ResponseCode::Refused);
}

#[tokio::test]
async fn unknown_names_fall_through() {
    let dns = server(traefik_cname()).await;

    let msg = execute_query(&dns, "nothing.docker.loc.", RecordType::A).await;
    assert_eq!(msg.response_code(), ResponseCode::Refused);

    let msg = execute_query(&dns, "dual.docker.loc.", RecordType::MX).await;
    assert_eq!(msg.response_code(), ResponseCode::Refused);
}

#[tokio::test]
async fn non_internet_class_falls_through() {
    let dns = server(traefik_cname()).await;
    let request = build_request("dual.docker.loc.", RecordType::A, DNSClass::CH);
    let response = TestResponseHandler::new();
    dns.handle_request(&request, response.clone()).await;
    assert_eq!(response.into_message().response_code(), ResponseCode::Refused);
}

#[tokio::test]
async fn lookup_ignores_case_and_keeps_query_spelling() {
    let dns = server(traefik_cname()).await;
    let msg = execute_query(&dns, "DUAL.Docker.LOC.", RecordType::A).await;

    assert_eq!(a_records(&msg), vec![Ipv4Addr::new(172, 17, 0, 3)]);
    assert_eq!(msg.answers()[0].name().to_ascii(), "DUAL.Docker.LOC.");
}
