//! Integration tests for the refresh-and-replay policy

use farmreg_http::{
    ApiRequest, CallOptions, ClientError, FarmRegClient, Method, Session, UserProfile, roles,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn operator_session(refresh_token: Option<&str>) -> Session {
    Session::new(
        "T1",
        refresh_token.map(str::to_string),
        Some(UserProfile::new("op@farm.zm", "Operator", [roles::OPERATOR])),
    )
}

fn second_user_session() -> Session {
    Session::new(
        "T9",
        Some("R9".into()),
        Some(UserProfile::new("bob@farm.zm", "Bob", [roles::OPERATOR])),
    )
}

fn client_for(server: &MockServer) -> FarmRegClient {
    let client = FarmRegClient::new(server.uri()).unwrap();
    client.store().set(operator_session(Some("R1")));
    client
}

async fn mount_farmers(server: &MockServer, token: &str, status: u16, times: u64) {
    let template = if status == 200 {
        ResponseTemplate::new(200).set_body_json(json!([{"id": "f-1", "first_name": "Mutale"}]))
    } else {
        ResponseTemplate::new(status).set_body_json(json!({"detail": "Token expired"}))
    };

    Mock::given(method("GET"))
        .and(path("/farmers"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(template)
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_refresh(server: &MockServer, template: ResponseTemplate, times: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({"refresh_token": "R1"})))
        .respond_with(template)
        .expect(times)
        .mount(server)
        .await;
}

fn refreshed_to(token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_json(json!({"access_token": token, "token_type": "bearer"}))
}

async fn get_farmers(client: &FarmRegClient) -> Result<serde_json::Value, ClientError> {
    client.call_json(Method::GET, "/farmers", None).await
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_replayed() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 1).await;
    mount_farmers(&mock_server, "T2", 200, 1).await;
    mount_refresh(&mock_server, refreshed_to("T2"), 1).await;

    let client = client_for(&mock_server);
    let farmers = get_farmers(&client).await.unwrap();

    assert_eq!(farmers[0]["id"], "f-1");
    let session = client.session().unwrap();
    assert_eq!(session.access_token, "T2");
    assert_eq!(session.refresh_token.as_deref(), Some("R1"));
    assert_eq!(session.roles(), ["OPERATOR"]);
    assert_eq!(client.coordinator().exchange_count(), 1);
}

#[tokio::test]
async fn test_concurrent_rejections_share_one_refresh() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 3).await;
    mount_farmers(&mock_server, "T2", 200, 3).await;
    mount_refresh(
        &mock_server,
        refreshed_to("T2").set_delay(Duration::from_millis(200)),
        1,
    )
    .await;

    let client = client_for(&mock_server);
    let (a, b, c) = tokio::join!(
        get_farmers(&client),
        get_farmers(&client),
        get_farmers(&client)
    );

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(client.store().access_token().as_deref(), Some("T2"));
    assert_eq!(client.coordinator().exchange_count(), 1);
    assert!(!client.coordinator().is_refreshing());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_parallel_rejections_share_one_refresh() {
    const CALLS: u64 = 12;

    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, CALLS).await;
    mount_farmers(&mock_server, "T2", 200, CALLS).await;
    mount_refresh(
        &mock_server,
        refreshed_to("T2").set_delay(Duration::from_millis(300)),
        1,
    )
    .await;

    let client = client_for(&mock_server);
    let mut calls = JoinSet::new();
    for _ in 0..CALLS {
        let client = client.clone();
        calls.spawn(async move { get_farmers(&client).await });
    }

    let mut succeeded = 0;
    while let Some(result) = calls.join_next().await {
        assert!(result.unwrap().is_ok());
        succeeded += 1;
    }

    assert_eq!(succeeded, CALLS);
    assert_eq!(client.coordinator().exchange_count(), 1);
}

#[tokio::test]
async fn test_failed_refresh_rejects_every_queued_call() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 3).await;
    mount_farmers(&mock_server, "T2", 200, 0).await;
    mount_refresh(
        &mock_server,
        ResponseTemplate::new(401)
            .set_body_json(json!({"detail": "Invalid or expired refresh token"}))
            .set_delay(Duration::from_millis(150)),
        1,
    )
    .await;

    let client = client_for(&mock_server);
    let mut changes = client.subscribe();

    let (a, b, c) = tokio::join!(
        get_farmers(&client),
        get_farmers(&client),
        get_farmers(&client)
    );

    for result in [a, b, c] {
        assert!(matches!(result, Err(ClientError::SessionExpired)));
    }
    assert!(client.session().is_none());
    assert!(changes.has_changed().unwrap());
    assert!(changes.borrow_and_update().session.is_none());
}

#[tokio::test]
async fn test_logout_during_refresh_rejects_replay() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 1).await;
    mount_farmers(&mock_server, "T2", 200, 0).await;
    mount_refresh(
        &mock_server,
        refreshed_to("T2").set_delay(Duration::from_millis(500)),
        1,
    )
    .await;

    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .and(header("authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let pending = tokio::spawn({
        let client = client.clone();
        async move { get_farmers(&client).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.coordinator().is_refreshing());

    client.logout().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::SessionExpired)));
    assert!(client.session().is_none());
}

#[tokio::test]
async fn test_second_rejection_after_replay_expires_session() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 1).await;
    mount_farmers(&mock_server, "T2", 401, 1).await;
    mount_refresh(&mock_server, refreshed_to("T2"), 1).await;

    let client = client_for(&mock_server);
    let result = get_farmers(&client).await;

    assert!(matches!(result, Err(ClientError::SessionExpired)));
    assert!(client.session().is_none());
    assert_eq!(client.coordinator().exchange_count(), 1);
}

#[tokio::test]
async fn test_missing_refresh_token_expires_without_refresh() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 1).await;
    mount_refresh(&mock_server, refreshed_to("T2"), 0).await;

    let client = FarmRegClient::new(mock_server.uri()).unwrap();
    client.store().set(operator_session(None));

    let result = get_farmers(&client).await;

    assert!(matches!(result, Err(ClientError::SessionExpired)));
    assert!(client.session().is_none());
    assert_eq!(client.coordinator().exchange_count(), 0);
}

#[tokio::test]
async fn test_hung_refresh_times_out() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 1).await;
    mount_refresh(
        &mock_server,
        refreshed_to("T2").set_delay(Duration::from_secs(5)),
        1,
    )
    .await;

    let client = FarmRegClient::builder()
        .base_url(mock_server.uri())
        .refresh_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    client.store().set(operator_session(Some("R1")));

    let started = std::time::Instant::now();
    let result = get_farmers(&client).await;

    assert!(matches!(result, Err(ClientError::SessionExpired)));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(client.session().is_none());
    assert!(!client.coordinator().is_refreshing());
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_refresh() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 1).await;
    mount_refresh(
        &mock_server,
        refreshed_to("T2").set_delay(Duration::from_secs(2)),
        1,
    )
    .await;

    let client = client_for(&mock_server);
    let pending = tokio::spawn({
        let client = client.clone();
        async move { get_farmers(&client).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.coordinator().shutdown();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::SessionExpired)));
    assert!(client.session().is_none());
}

#[tokio::test]
async fn test_shutdown_while_idle_does_not_block_later_refreshes() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 1).await;
    mount_farmers(&mock_server, "T2", 200, 1).await;
    mount_refresh(&mock_server, refreshed_to("T2"), 1).await;

    let client = client_for(&mock_server);
    client.coordinator().shutdown();

    let farmers = get_farmers(&client).await.unwrap();
    assert_eq!(farmers[0]["id"], "f-1");
    assert_eq!(client.store().access_token().as_deref(), Some("T2"));
    assert_eq!(client.coordinator().exchange_count(), 1);
}

#[tokio::test]
async fn test_relogin_during_refresh_keeps_new_session() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 1).await;
    mount_farmers(&mock_server, "T2", 200, 0).await;
    mount_refresh(
        &mock_server,
        refreshed_to("T2").set_delay(Duration::from_millis(400)),
        1,
    )
    .await;

    let client = client_for(&mock_server);
    let pending = tokio::spawn({
        let client = client.clone();
        async move { get_farmers(&client).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.coordinator().is_refreshing());
    client.store().set(second_user_session());

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::SessionExpired)));

    // Let the abandoned exchange finish; it must not touch the new login.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let session = client.session().unwrap();
    assert_eq!(session.access_token, "T9");
    assert_eq!(session.user.unwrap().id, "bob@farm.zm");
    assert!(!client.coordinator().is_refreshing());
}

#[tokio::test]
async fn test_late_rejection_of_replay_keeps_newer_login() {
    let mock_server = MockServer::start().await;
    mount_farmers(&mock_server, "T1", 401, 1).await;
    mount_refresh(&mock_server, refreshed_to("T2"), 1).await;

    Mock::given(method("GET"))
        .and(path("/farmers"))
        .and(header("authorization", "Bearer T2"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"detail": "Token revoked"}))
                .set_delay(Duration::from_millis(400)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let pending = tokio::spawn({
        let client = client.clone();
        async move { get_farmers(&client).await }
    });

    // Wait until the replay with T2 is on the wire, then log in as someone else.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.store().access_token().as_deref(), Some("T2"));
    client.store().set(second_user_session());

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ClientError::SessionExpired)));
    assert_eq!(client.store().access_token().as_deref(), Some("T9"));
}

#[tokio::test]
async fn test_exchange_not_counted_when_session_ends_before_sending() {
    let mock_server = MockServer::start().await;
    mount_refresh(&mock_server, refreshed_to("T2"), 0).await;

    let client = client_for(&mock_server);
    let coordinator = Arc::clone(client.coordinator());
    let waiting = coordinator.enqueue(ApiRequest::new(Method::GET, "/farmers"), Some("T1"));
    tokio::pin!(waiting);

    // Poll once so the cycle is started but its task has not run yet.
    tokio::select! {
        biased;
        _ = &mut waiting => panic!("refresh cycle settled before it ran"),
        () = std::future::ready(()) => {}
    }
    client.store().set(second_user_session());

    let result = waiting.await;
    assert!(matches!(result, Err(ClientError::SessionExpired)));
    assert_eq!(client.coordinator().exchange_count(), 0);
    assert_eq!(client.store().access_token().as_deref(), Some("T9"));
}

#[tokio::test]
async fn test_other_errors_pass_through_without_refresh() {
    let mock_server = MockServer::start().await;
    mount_refresh(&mock_server, refreshed_to("T2"), 0).await;

    Mock::given(method("POST"))
        .and(path("/farmers"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"detail": "NRC already registered"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/dashboard/stats"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    let created = client
        .call(
            Method::POST,
            "/farmers",
            Some(json!({"nrc": "123456101"})),
            CallOptions::default(),
        )
        .await;
    match created {
        Err(ClientError::Validation { status, message }) => {
            assert_eq!(status, 422);
            assert_eq!(message, "NRC already registered");
        }
        other => panic!("expected Validation, got {other:?}"),
    }

    let stats = client
        .call(Method::GET, "/dashboard/stats", None, CallOptions::default())
        .await;
    assert!(matches!(stats, Err(ClientError::Server { status: 500, .. })));

    assert_eq!(client.store().access_token().as_deref(), Some("T1"));
}

#[tokio::test]
async fn test_network_failure_is_surfaced() {
    let uri = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };

    let client = FarmRegClient::new(uri).unwrap();
    client.store().set(operator_session(Some("R1")));

    let result = get_farmers(&client).await;
    assert!(matches!(result, Err(ClientError::Request(_))));
    assert!(client.session().is_some());
}

#[tokio::test]
async fn test_skip_auth_sends_no_token_and_never_refreshes() {
    let mock_server = MockServer::start().await;
    mount_refresh(&mock_server, refreshed_to("T2"), 0).await;

    Mock::given(method("GET"))
        .and(path("/geo/provinces"))
        .and(|request: &Request| !request.headers.contains_key("authorization"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let result = client
        .call(
            Method::GET,
            "/geo/provinces",
            None,
            CallOptions::default().without_auth(),
        )
        .await;

    assert!(matches!(result, Err(ClientError::Unauthorized(_))));
    assert!(client.session().is_some());
}

#[tokio::test]
async fn test_stale_rejection_uses_current_token() {
    let mock_server = MockServer::start().await;
    mount_refresh(&mock_server, refreshed_to("T3"), 0).await;

    let client = client_for(&mock_server);
    let generation = client.store().generation();
    client.store().replace_access_token(generation, "T2").unwrap();

    let replay = client
        .coordinator()
        .enqueue(ApiRequest::new(Method::GET, "/farmers"), Some("T1"))
        .await
        .unwrap();

    assert_eq!(replay.access_token, "T2");
    assert_eq!(replay.request.path, "/farmers");
    assert_eq!(client.coordinator().exchange_count(), 0);
}
