//! End-to-end behavior of the guard in front of a mock upstream.

use axum::{
    body::Body,
    http::{header, Method, StatusCode},
    Router,
};
use edge_guard::config::{AppCheckMode, FailurePolicy};
use edge_guard::observability::events::{EventQuery, EventType, SecurityEvent};
use edge_guard::store::SharedStore;
use edge_guard::GuardHandle;
use std::sync::Arc;
use tower::ServiceExt;

mod common;
use common::*;

async fn fetch_csrf_cookie(app: &Router, ip: &str) -> String {
    let response = app
        .clone()
        .oneshot(empty(browser(Method::GET, "/", ip)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    set_cookie_value(&response, "csrf_token").expect("csrf cookie issued on safe request")
}

async fn events_of(guards: &GuardHandle, event_type: EventType) -> usize {
    latest_events(guards, event_type).await.len()
}

async fn latest_events(guards: &GuardHandle, event_type: EventType) -> Vec<SecurityEvent> {
    let query = EventQuery {
        event_type: Some(event_type),
        ..Default::default()
    };
    let guard = guards.load_full();
    guard.monitor().events(&query).await.unwrap().events
}

fn intel_config(upstream: std::net::SocketAddr) -> edge_guard::GuardConfig {
    let mut config = test_config(upstream);
    config.ip_intel.enabled = true;
    config.ip_intel.denied_countries = vec!["KP".to_string()];
    config.ip_intel.denied_asns = vec![64666];
    config
}

#[tokio::test]
async fn test_eleventh_login_is_rate_limited() {
    let (upstream, _) = start_mock_upstream().await;
    let (app, guards) = build_app(test_config(upstream), memory_store());
    let ip = "1.2.3.4";
    let cookie = fetch_csrf_cookie(&app, ip).await;

    for attempt in 1..=10 {
        let response = app
            .clone()
            .oneshot(empty(
                browser(Method::POST, "/api/auth/login", ip)
                    .header(header::COOKIE, format!("csrf_token={cookie}"))
                    .header("x-csrf-token", &cookie),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "attempt {attempt}");
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
    }

    let response = app
        .clone()
        .oneshot(empty(
            browser(Method::POST, "/api/auth/login", ip)
                .header(header::COOKIE, format!("csrf_token={cookie}"))
                .header("x-csrf-token", &cookie),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert!(response.headers().contains_key("content-security-policy"));

    let body = json_body(response).await;
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["remaining"], 0);
    assert_eq!(events_of(&guards, EventType::RateLimitExceeded).await, 1);

    // Another client is unaffected.
    let other = app
        .clone()
        .oneshot(empty(browser(Method::GET, "/api/articles", "5.6.7.8")))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_post_with_cookie_but_no_header_is_csrf_denied() {
    let (upstream, captures) = start_mock_upstream().await;
    let (app, guards) = build_app(test_config(upstream), memory_store());
    let cookie = fetch_csrf_cookie(&app, "10.1.1.1").await;

    let response = app
        .clone()
        .oneshot(empty(
            browser(Method::POST, "/api/articles", "10.1.1.1")
                .header(header::COOKIE, format!("csrf_token={cookie}")),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"], "csrf_invalid");
    assert_eq!(body["reason"], "missing_token");
    assert_eq!(events_of(&guards, EventType::CsrfInvalid).await, 1);
    // Only the initial GET reached the upstream.
    assert_eq!(captures.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_nonce_is_fresh_and_reaches_upstream() {
    let (upstream, captures) = start_mock_upstream().await;
    let (app, _) = build_app(test_config(upstream), memory_store());

    let mut policies = Vec::new();
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(empty(browser(Method::GET, "/articles/rust", "10.2.2.2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert!(response.headers().contains_key("strict-transport-security"));
        policies.push(
            response.headers()["content-security-policy"]
                .to_str()
                .unwrap()
                .to_string(),
        );
    }
    assert_ne!(policies[0], policies[1]);

    let captured = captures.lock().unwrap().clone();
    assert_eq!(captured.len(), 2);
    for (request, policy) in captured.iter().zip(&policies) {
        let nonce = request.header("x-nonce").expect("nonce forwarded");
        assert!(policy.contains(&format!("'nonce-{nonce}'")));
        assert_eq!(request.header("x-forwarded-for").as_deref(), Some("10.2.2.2"));
        assert!(request.header("x-request-id").is_some());
    }
}

#[tokio::test]
async fn test_scanner_is_auto_blocked_until_lifted() {
    let (upstream, _) = start_mock_upstream().await;
    let (app, guards) = build_app(test_config(upstream), memory_store());
    let ip = "6.6.6.6";

    let scan = axum::http::Request::builder()
        .method(Method::GET)
        .uri("/../../etc/passwd")
        .header("x-forwarded-for", ip)
        .header(header::USER_AGENT, "Mozilla/5.00 (Nikto/2.1.6)")
        .header(header::ACCEPT, "*/*")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(scan).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(json_body(response).await["error"], "auto_blocked");

    // A well-behaved request from the same client is still refused.
    let response = app
        .clone()
        .oneshot(empty(browser(Method::GET, "/", ip)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "auto_blocked");

    assert_eq!(events_of(&guards, EventType::AutoBlocked).await, 1);
    assert_eq!(events_of(&guards, EventType::BlockedRequest).await, 1);

    let other = app
        .clone()
        .oneshot(empty(browser(Method::GET, "/", "7.7.7.7")))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);

    assert!(guards.load().anomaly().unblock(ip).await.unwrap());
    let response = app
        .clone()
        .oneshot(empty(browser(Method::GET, "/", ip)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_store_outage_follows_failure_policy() {
    let (upstream, _) = start_mock_upstream().await;
    let failing: SharedStore = Arc::new(FailingStore);

    let (open_app, _) = build_app(test_config(upstream), failing.clone());
    let response = open_app
        .oneshot(empty(browser(Method::GET, "/api/articles", "10.3.3.3")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut config = test_config(upstream);
    config.store.failure_policy = FailurePolicy::Closed;
    let (closed_app, _) = build_app(config, failing);
    let response = closed_app
        .oneshot(empty(browser(Method::GET, "/api/articles", "10.3.3.3")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("content-security-policy"));
    let body = json_body(response).await;
    assert_eq!(body["error"], "dependency_unavailable");
    assert!(!body["message"].as_str().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_strict_app_check() {
    let (upstream, _) = start_mock_upstream().await;
    let mut config = test_config(upstream);
    config.app_check.mode = AppCheckMode::Strict;
    let (app, guards) = build_app(config, memory_store());

    let denied = app
        .clone()
        .oneshot(empty(browser(Method::GET, "/api/articles", "10.4.4.4")))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(denied).await["error"], "app_check_required");
    assert_eq!(events_of(&guards, EventType::AppCheckMissing).await, 1);

    let allowed = app
        .clone()
        .oneshot(empty(
            browser(Method::GET, "/api/articles", "10.4.4.4").header("x-app-check", "attestation"),
        ))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    // Pages are not protected.
    let page = app
        .oneshot(empty(browser(Method::GET, "/about", "10.4.4.4")))
        .await
        .unwrap();
    assert_eq!(page.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_form_field_token_and_body_preserved() {
    let (upstream, captures) = start_mock_upstream().await;
    let (app, _) = build_app(test_config(upstream), memory_store());
    let cookie = fetch_csrf_cookie(&app, "10.5.5.5").await;

    let form = format!("csrf_token={}&comment=hello+world", urlencoding::encode(&cookie));
    let response = app
        .clone()
        .oneshot(
            browser(Method::POST, "/api/comments", "10.5.5.5")
                .header(header::COOKIE, format!("csrf_token={cookie}"))
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(header::CONTENT_LENGTH, form.len())
                .body(Body::from(form.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let captured = captures.lock().unwrap().clone();
    let last = captured.last().unwrap();
    assert_eq!(String::from_utf8_lossy(&last.body), form);
}

#[tokio::test]
async fn test_single_use_token_rotates_and_rejects_replay() {
    let (upstream, _) = start_mock_upstream().await;
    let (app, guards) = build_app(test_config(upstream), memory_store());
    let ip = "10.6.6.6";
    let cookie = fetch_csrf_cookie(&app, ip).await;

    let payout = |token: &str| {
        empty(
            browser(Method::POST, "/api/payouts", ip)
                .header(header::COOKIE, format!("csrf_token={token}"))
                .header("x-csrf-token", token),
        )
    };

    let first = app.clone().oneshot(payout(&cookie)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let rotated = set_cookie_value(&first, "csrf_token").expect("token rotated after use");
    assert_ne!(rotated, cookie);

    let replay = app.clone().oneshot(payout(&cookie)).await.unwrap();
    assert_eq!(replay.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(replay).await["reason"], "replayed");
    assert_eq!(events_of(&guards, EventType::CsrfInvalid).await, 1);

    let fresh = app.clone().oneshot(payout(&rotated)).await.unwrap();
    assert_eq!(fresh.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_static_assets_bypass_checks() {
    let (upstream, captures) = start_mock_upstream().await;
    let (app, _) = build_app(test_config(upstream), memory_store());

    let response = app
        .oneshot(empty(browser(Method::GET, "/_next/static/chunks/main.js", "10.7.7.7")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("content-security-policy"));
    assert!(!response.headers().contains_key("x-ratelimit-limit"));
    assert!(set_cookie_value(&response, "csrf_token").is_none());
    assert!(captures.lock().unwrap()[0].header("x-nonce").is_none());
}

#[tokio::test]
async fn test_upstream_down_is_bad_gateway() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let (app, _) = build_app(test_config(dead), memory_store());
    let response = app
        .oneshot(empty(browser(Method::GET, "/", "10.8.8.8")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response.headers().contains_key("content-security-policy"));
    assert_eq!(json_body(response).await["error"], "upstream_error");
}

#[tokio::test]
async fn test_denied_country_and_asn_are_refused() {
    let (upstream, captures) = start_mock_upstream().await;

    let by_country = StubProvider::answering(Some("KP"), Some(131279), 0, false);
    let (app, guards) = build_app_with_provider(intel_config(upstream), memory_store(), Some(by_country.clone()));
    let response = app
        .clone()
        .oneshot(empty(browser(Method::GET, "/articles", "198.51.100.7")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().contains_key("content-security-policy"));
    assert_eq!(json_body(response).await["error"], "ip_denied");

    let events = latest_events(&guards, EventType::IpDenied).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].identity, "198.51.100.7");
    assert_eq!(events[0].metadata["country"], "KP");

    // The cached record keeps denying without another lookup.
    let again = app
        .oneshot(empty(browser(Method::GET, "/articles", "198.51.100.7")))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::FORBIDDEN);
    assert_eq!(by_country.lookups(), 1);

    let by_asn = StubProvider::answering(Some("NL"), Some(64666), 0, false);
    let (app, guards) = build_app_with_provider(intel_config(upstream), memory_store(), Some(by_asn));
    let response = app
        .oneshot(empty(browser(Method::GET, "/articles", "198.51.100.8")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(latest_events(&guards, EventType::IpDenied).await[0].metadata["asn"], 64666);

    assert!(captures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_provider_failure_degrades_to_allow() {
    let (upstream, captures) = start_mock_upstream().await;
    let provider = StubProvider::failing();
    let (app, guards) = build_app_with_provider(intel_config(upstream), memory_store(), Some(provider.clone()));

    let response = app
        .oneshot(empty(browser(Method::GET, "/articles", "198.51.100.9")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(captures.lock().unwrap().len(), 1);
    assert_eq!(provider.lookups(), 1);

    let events = latest_events(&guards, EventType::UpstreamDependencyUnavailable).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata["dependency"], "ip_intel");
    assert_eq!(events_of(&guards, EventType::IpDenied).await, 0);
}

#[tokio::test]
async fn test_reputation_feeds_anomaly_score() {
    let (upstream, _) = start_mock_upstream().await;
    let provider = StubProvider::answering(Some("US"), Some(64500), 90, true);
    let (app, guards) = build_app_with_provider(intel_config(upstream), memory_store(), Some(provider));

    let response = app
        .oneshot(empty(browser(Method::GET, "/articles", "198.51.100.10")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = latest_events(&guards, EventType::AnomalyDetected).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata["score"], 37);
    let reasons = events[0].metadata["reasons"].as_array().unwrap();
    assert!(reasons.iter().any(|r| r == "proxy"));
    assert!(reasons.iter().any(|r| r == "ip_reputation 90"));
}

#[tokio::test]
async fn test_doubled_slashes_hit_the_auth_limit() {
    let (upstream, _) = start_mock_upstream().await;
    let (app, _) = build_app(test_config(upstream), memory_store());

    let response = app
        .oneshot(empty(browser(Method::GET, "//api/auth/session", "10.8.8.8")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "10");
}
