//! Integration tests for the HTTP pairing client
//!
//! Tests behavioral contracts against a mock pairing API:
//! - Broker discovery with bearer authentication
//! - Certificate reuse, verification and renewal
//! - Error responses mapped to typed errors

use astarte_device::pairing::certificate::{CERTIFICATE_FILE, PRIVATE_KEY_FILE};
use astarte_device::pairing::{
    DeviceIdentity, PairingApi, PairingClient, PairingClientConfig, PairingError,
};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const DEVICE_PATH: &str = "/pairing/v1/test/devices/2TBn-jNESuuHamE2Zo1anA";

fn identity() -> DeviceIdentity {
    DeviceIdentity::new("test", "2TBn-jNESuuHamE2Zo1anA", "test-secret")
}

fn client(server: &MockServer) -> PairingClient {
    let base = Url::parse(&format!("{}/pairing", server.uri())).unwrap();
    let mut config = PairingClientConfig::new(base);
    config.timeout = Duration::from_secs(5);
    PairingClient::new(config).unwrap()
}

fn credentials_path() -> String {
    format!("{DEVICE_PATH}/protocols/astarte_mqtt_v1/credentials")
}

fn verify_path() -> String {
    format!("{DEVICE_PATH}/protocols/astarte_mqtt_v1/credentials/verify")
}

#[tokio::test]
async fn test_broker_url_resolved_with_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DEVICE_PATH))
        .and(header("Authorization", "Bearer test-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "version": "1.0",
                "status": "connected",
                "protocols": {
                    "astarte_mqtt_v1": {"broker_url": "mqtts://broker.example.com:8883/"}
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let url = client(&server).broker_url(&identity()).await.unwrap();

    assert_eq!(url.scheme(), "mqtts");
    assert_eq!(url.host_str(), Some("broker.example.com"));
    assert_eq!(url.port(), Some(8883));
}

#[tokio::test]
async fn test_broker_url_auth_failure() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DEVICE_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
        .mount(&server)
        .await;

    let result = client(&server).broker_url(&identity()).await;

    assert!(matches!(
        result,
        Err(PairingError::Http { status: 401, ref message }) if message == "invalid credentials"
    ));
}

#[tokio::test]
async fn test_broker_url_malformed_response() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DEVICE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"protocols": {}}})))
        .mount(&server)
        .await;

    let result = client(&server).broker_url(&identity()).await;
    assert!(matches!(result, Err(PairingError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_broker_url_unreachable_api() {
    let base = Url::parse("http://127.0.0.1:9/pairing").unwrap();
    let mut config = PairingClientConfig::new(base);
    config.timeout = Duration::from_secs(2);
    let client = PairingClient::new(config).unwrap();

    let result = client.broker_url(&identity()).await;
    assert!(matches!(result, Err(PairingError::Request(_))));
}

#[tokio::test]
async fn test_new_certificate_requested_and_stored() {
    let server = MockServer::start().await;
    let persistency = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .and(path(credentials_path()))
        .and(header("Authorization", "Bearer test-secret"))
        .and(|request: &Request| {
            let body: serde_json::Value = match serde_json::from_slice(&request.body) {
                Ok(body) => body,
                Err(_) => return false,
            };
            body["data"]["csr"]
                .as_str()
                .map(|csr| csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"))
                .unwrap_or(false)
        })
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": {"client_crt": "-----BEGIN CERTIFICATE-----\nISSUED\n-----END CERTIFICATE-----\n"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(verify_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"valid": true}})))
        .expect(0)
        .mount(&server)
        .await;

    let certificate = client(&server)
        .ensure_certificate(&identity(), persistency.path())
        .await
        .unwrap();

    assert!(certificate.certificate_pem.contains("ISSUED"));
    assert!(certificate.private_key_pem().contains("PRIVATE KEY-----"));

    let stored_certificate =
        std::fs::read_to_string(persistency.path().join(CERTIFICATE_FILE)).unwrap();
    let stored_key = std::fs::read_to_string(persistency.path().join(PRIVATE_KEY_FILE)).unwrap();
    assert_eq!(stored_certificate, certificate.certificate_pem);
    assert_eq!(stored_key, certificate.private_key_pem());
}

#[tokio::test]
async fn test_valid_stored_certificate_is_reused() {
    let server = MockServer::start().await;
    let persistency = TempDir::new().unwrap();
    std::fs::write(persistency.path().join(CERTIFICATE_FILE), "STORED CERT").unwrap();
    std::fs::write(persistency.path().join(PRIVATE_KEY_FILE), "STORED KEY").unwrap();

    Mock::given(method("POST"))
        .and(path(verify_path()))
        .and(body_partial_json(json!({"data": {"client_crt": "STORED CERT"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"valid": true}})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(credentials_path()))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let certificate = client(&server)
        .ensure_certificate(&identity(), persistency.path())
        .await
        .unwrap();

    assert_eq!(certificate.certificate_pem, "STORED CERT");
    assert_eq!(certificate.private_key_pem(), "STORED KEY");
}

#[tokio::test]
async fn test_rejected_stored_certificate_is_renewed() {
    let server = MockServer::start().await;
    let persistency = TempDir::new().unwrap();
    std::fs::write(persistency.path().join(CERTIFICATE_FILE), "EXPIRED CERT").unwrap();
    std::fs::write(persistency.path().join(PRIVATE_KEY_FILE), "OLD KEY").unwrap();

    Mock::given(method("POST"))
        .and(path(verify_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"valid": false, "cause": "EXPIRED"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(credentials_path()))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": {"client_crt": "RENEWED CERT"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let certificate = client(&server)
        .ensure_certificate(&identity(), persistency.path())
        .await
        .unwrap();

    assert_eq!(certificate.certificate_pem, "RENEWED CERT");
    assert_ne!(certificate.private_key_pem(), "OLD KEY");
    assert_eq!(
        std::fs::read_to_string(persistency.path().join(CERTIFICATE_FILE)).unwrap(),
        "RENEWED CERT"
    );
}

#[tokio::test]
async fn test_certificate_request_failure() {
    let server = MockServer::start().await;
    let persistency = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .and(path(credentials_path()))
        .respond_with(ResponseTemplate::new(403).set_body_string("device inhibited"))
        .mount(&server)
        .await;

    let result = client(&server)
        .ensure_certificate(&identity(), persistency.path())
        .await;

    assert!(matches!(result, Err(PairingError::Http { status: 403, .. })));
    assert!(!persistency.path().join(CERTIFICATE_FILE).exists());
}
