//! End-to-end OAuth flow through the HTTP router

mod common;

use std::net::SocketAddr;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;

use common::{REDIRECT, REGISTRATION_TOKEN, VERIFIER, app, authorization_server, oauth_config};
use mcp_kubernetes::oauth::tokens::s256_challenge;

const CLIENT_IP: &str = "203.0.113.7";

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn location(response: &Response<Body>) -> Url {
    let raw = response.headers()[header::LOCATION].to_str().unwrap();
    Url::parse(raw).unwrap()
}

fn query(url: &Url, name: &str) -> Option<String> {
    url.query_pairs().find(|(k, _)| k == name).map(|(_, v)| v.into_owned())
}

async fn register(app: &Router) -> String {
    let response = send(
        app,
        Request::post("/oauth/register")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {REGISTRATION_TOKEN}"))
            .header("x-forwarded-for", CLIENT_IP)
            .body(Body::from(
                json!({ "redirect_uris": [REDIRECT], "client_name": "Agent" }).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["token_endpoint_auth_method"], "none");
    body["client_id"].as_str().unwrap().to_string()
}

/// authorize, then the upstream callback; returns the downstream code
async fn login(app: &Router, client_id: &str) -> String {
    let authorize = Url::parse_with_params(
        "http://localhost/oauth/authorize",
        &[
            ("response_type", "code"),
            ("client_id", client_id),
            ("redirect_uri", REDIRECT),
            ("state", "xyz"),
            ("code_challenge", &s256_challenge(VERIFIER)),
            ("code_challenge_method", "S256"),
        ],
    )
    .unwrap();
    let path = format!("{}?{}", authorize.path(), authorize.query().unwrap());
    let response = send(app, Request::get(path).header("x-forwarded-for", CLIENT_IP).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let upstream = location(&response);
    assert_eq!(upstream.host_str(), Some("idp.example.com"));
    let upstream_state = query(&upstream, "state").unwrap();
    assert_eq!(
        query(&upstream, "redirect_uri").as_deref(),
        Some("https://mcp.example.com/oauth/callback")
    );

    let callback = format!("/oauth/callback?code=upstream-ok&state={upstream_state}");
    let response = send(app, Request::get(callback).header("x-forwarded-for", CLIENT_IP).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let back = location(&response);
    assert!(back.as_str().starts_with(REDIRECT));
    assert_eq!(query(&back, "state").as_deref(), Some("xyz"));
    query(&back, "code").unwrap()
}

fn token_request(client_id: &str, code: &str) -> Request<Body> {
    let form = serde_urlencoded::to_string([
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", REDIRECT),
        ("code_verifier", VERIFIER),
        ("client_id", client_id),
    ])
    .unwrap();
    Request::post("/oauth/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header("x-forwarded-for", CLIENT_IP)
        .body(Body::from(form))
        .unwrap()
}

fn mcp_request(token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::post("/mcp").header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn metadata_documents_point_at_this_server() {
    let app = app(Some(authorization_server(oauth_config())), None);

    let response = send(
        &app,
        Request::get("/.well-known/oauth-authorization-server").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["issuer"], "https://mcp.example.com");
    assert_eq!(body["token_endpoint"], "https://mcp.example.com/oauth/token");
    assert_eq!(body["code_challenge_methods_supported"], json!(["S256"]));

    let response = send(
        &app,
        Request::get("/.well-known/oauth-protected-resource").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn mcp_without_bearer_gets_a_resource_metadata_challenge() {
    let app = app(Some(authorization_server(oauth_config())), None);

    let response = send(&app, mcp_request(None, &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap(),
        "Bearer resource_metadata=\"https://mcp.example.com/.well-known/oauth-protected-resource\""
    );
}

#[tokio::test]
async fn registration_requires_the_token() {
    let app = app(Some(authorization_server(oauth_config())), None);

    let response = send(
        &app,
        Request::post("/oauth/register")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "redirect_uris": [REDIRECT] }).to_string()))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "invalid_token");
}

#[tokio::test]
async fn login_flow_grants_access_to_mcp() {
    // GIVEN: a registered public client that completed the upstream login
    let app = app(Some(authorization_server(oauth_config())), None);
    let client_id = register(&app).await;
    let code = login(&app, &client_id).await;

    // WHEN: the code is exchanged with the matching verifier
    let response = send(&app, token_request(&client_id, &code)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    let tokens = json_body(response).await;
    let access_token = tokens["access_token"].as_str().unwrap();

    // THEN: the bearer opens /mcp
    assert_eq!(tokens["token_type"], "Bearer");
    let response = send(
        &app,
        mcp_request(Some(access_token), &json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["id"], 7);
    assert!(body["result"]["tools"].as_array().is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn replayed_code_is_rejected_and_revokes_the_grant() {
    // GIVEN: a code already exchanged once
    let app = app(Some(authorization_server(oauth_config())), None);
    let client_id = register(&app).await;
    let code = login(&app, &client_id).await;
    let first = json_body(send(&app, token_request(&client_id, &code)).await).await;
    let access_token = first["access_token"].as_str().unwrap().to_string();

    // WHEN: it is presented again
    let response = send(&app, token_request(&client_id, &code)).await;

    // THEN: invalid_grant, and the first access token stops working
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_grant");
    let response = send(
        &app,
        mcp_request(Some(&access_token), &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_verifier_fails_the_exchange() {
    let app = app(Some(authorization_server(oauth_config())), None);
    let client_id = register(&app).await;
    let code = login(&app, &client_id).await;

    let form = serde_urlencoded::to_string([
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", REDIRECT),
        ("code_verifier", "x".repeat(43).as_str()),
        ("client_id", client_id.as_str()),
    ])
    .unwrap();
    let response = send(
        &app,
        Request::post("/oauth/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_grant");
}

async fn register_via(app: &Router, peer: &str, forwarded_for: &str) -> StatusCode {
    let peer: SocketAddr = peer.parse().unwrap();
    send(
        app,
        Request::post("/oauth/register")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {REGISTRATION_TOKEN}"))
            .header("x-forwarded-for", forwarded_for)
            .extension(ConnectInfo(peer))
            .body(Body::from(json!({ "redirect_uris": [REDIRECT] }).to_string()))
            .unwrap(),
    )
    .await
    .status()
}

#[tokio::test]
async fn rotating_forwarded_for_does_not_escape_the_registration_cap() {
    // GIVEN: the default cap of 10 and no trusted proxies
    let app = app(Some(authorization_server(oauth_config())), None);

    // WHEN: one peer claims a new X-Forwarded-For address on every attempt
    let mut statuses = Vec::new();
    for i in 0..15 {
        statuses.push(register_via(&app, "203.0.113.50:40000", &format!("198.51.100.{i}")).await);
    }

    // THEN: the peer address is capped
    let created = statuses.iter().filter(|s| **s == StatusCode::CREATED).count();
    assert_eq!(created, 10);
    assert!(statuses[10..].iter().all(|s| *s == StatusCode::TOO_MANY_REQUESTS));
}

#[tokio::test]
async fn trusted_proxy_forwards_distinct_clients() {
    // GIVEN: requests arriving through a trusted ingress
    let mut config = oauth_config();
    config.trusted_proxies = vec!["10.0.0.0/8".to_string()];
    let app = app(Some(authorization_server(config)), None);

    // WHEN: twelve different clients register once each
    let mut created = 0;
    for i in 0..12 {
        if register_via(&app, "10.0.0.5:40000", &format!("198.51.100.{i}")).await == StatusCode::CREATED {
            created += 1;
        }
    }

    // THEN: each client has its own cap
    assert_eq!(created, 12);
}
