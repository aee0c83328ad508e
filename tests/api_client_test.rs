//! Device API client tests against a mock server
//!
//! Covers lazy authorization, re-authorization on 401, the retry budget for
//! server errors and the API source/sink round trip.

use pingfleet::error::{AuthFailure, Error};
use pingfleet::remote::{ApiClient, ApiClientConfig};
use pingfleet::sinks::{ApiSink, ResultSink};
use pingfleet::sources::ApiSource;
use pingfleet::targets::{HostResolver, HostSource};
use pingfleet::{Host, ProbeResult};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> ApiClient {
    let config = ApiClientConfig::new(server.uri(), "probe-01", "s3cret")
        .with_retry_delay(Duration::from_millis(10));
    ApiClient::new(config).unwrap()
}

async fn mount_auth(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/auth"))
        .and(body_json(json!({"name": "probe-01", "secret": "s3cret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": token,
            "id_server": 7
        })))
        .mount(server)
        .await;
}

/// Device list is fetched with the session token and server id
#[tokio::test]
async fn test_load_devices_with_token() {
    let mock_server = MockServer::start().await;
    mount_auth(&mock_server, "tok-1").await;

    Mock::given(method("GET"))
        .and(path("/devices/7"))
        .and(header("X-Auth-Token", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "ip": "10.0.0.1"},
            {"id": 2, "ip": "10.0.0.2", "inactive_since": "2024-05-01T10:00:00Z"}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let devices = client.load_devices().await.unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[1].id, 2);
    assert!(devices[1].inactive_since().is_some());
    assert_eq!(client.session().await.unwrap().server_id, 7);
}

/// A 401 on a resource call triggers exactly one re-authorization
#[tokio::test]
async fn test_unauthorized_reauthorizes_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "tok",
            "id_server": 7
        })))
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/devices/7"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/devices/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let devices = client.load_devices().await.unwrap();
    assert!(devices.is_empty());
}

/// A session the server never accepts re-authorizes between attempts, then gives up
#[tokio::test]
async fn test_persistent_unauthorized_exhausts_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "tok",
            "id_server": 7
        })))
        .expect(3)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/devices/7"))
        .respond_with(ResponseTemplate::new(401))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let err = client.load_devices().await.unwrap_err();

    assert!(matches!(
        err,
        Error::RetryExhausted {
            attempts: 3,
            last_status: Some(401)
        }
    ));

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 6);
    let auth_posts = requests
        .iter()
        .filter(|r| r.url.path() == "/auth")
        .count();
    assert_eq!(auth_posts, 3);
}

/// Persistent server errors exhaust the attempt budget
#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let mock_server = MockServer::start().await;
    mount_auth(&mock_server, "tok").await;

    Mock::given(method("GET"))
        .and(path("/devices/7"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let err = client.load_devices().await.unwrap_err();

    match err {
        Error::RetryExhausted {
            attempts,
            last_status,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_status, Some(500));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

/// A transient server error is retried and succeeds
#[tokio::test]
async fn test_transient_server_error_recovers() {
    let mock_server = MockServer::start().await;
    mount_auth(&mock_server, "tok").await;

    Mock::given(method("GET"))
        .and(path("/devices/7"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/devices/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 4, "ip": "10.0.0.4"}])))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let devices = client.load_devices().await.unwrap();
    assert_eq!(devices[0].id, 4);
}

/// Other non-success statuses fail without retry
#[tokio::test]
async fn test_not_found_fails_fast() {
    let mock_server = MockServer::start().await;
    mount_auth(&mock_server, "tok").await;

    Mock::given(method("GET"))
        .and(path("/devices/7"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let err = client.load_devices().await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedStatus { status: 404, .. }));
}

/// Rejected credentials surface as an authentication error
#[tokio::test]
async fn test_auth_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let err = client.ensure_session().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Authentication(AuthFailure::Rejected { status: 401 })
    ));
    assert!(client.session().await.is_none());
}

/// Malformed auth body is reported as an invalid response
#[tokio::test]
async fn test_auth_invalid_json() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let err = client.load_devices().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Authentication(AuthFailure::InvalidResponse(_))
    ));
}

/// Devices flow in through the source and results flow back through the sink
#[tokio::test]
async fn test_source_and_sink_round_trip() {
    let mock_server = MockServer::start().await;
    mount_auth(&mock_server, "tok-rt").await;

    Mock::given(method("GET"))
        .and(path("/devices/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 11, "ip": "10.1.0.1"}
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/devices/11"))
        .and(header("X-Auth-Token", "tok-rt"))
        .and(body_json(json!({"loss": 25.0, "average_time": 0.5})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Arc::new(client_for(&mock_server));

    let hosts = ApiSource::new(Arc::clone(&client))
        .load(&HostResolver::new(80))
        .await
        .unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].id, 11);
    assert_eq!(hosts[0].address, "10.1.0.1");

    let sink = ApiSink::new(client);
    let result = ProbeResult::new(hosts[0].clone(), 25.0, Some(Duration::from_millis(500)));
    sink.write(&result).await.unwrap();

    // Hosts without an API id never reach the server
    let unknown = ProbeResult::new(Host::new("10.9.9.9", "80"), 0.0, None);
    sink.write(&unknown).await.unwrap();
}
