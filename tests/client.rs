use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use httpmock::Method::PATCH;
use httpmock::prelude::*;
use serde_json::{Map, Value, json};

use spectra_processor::auth::{AuthSession, HttpTokenIssuer, TokenIssuer};
use spectra_processor::client::{SpectraClient, SpectraHttpClient, resolve_url};
use spectra_processor::config::ServiceCredentials;
use spectra_processor::domain::{CanonicalBuffer, Credential, ProcessingStatus, SpectrumId};
use spectra_processor::error::ProcessingError;
use spectra_processor::retry::RetryPolicy;

// Nothing listens on port 1, so every request fails at connect time.
const UNREACHABLE: &str = "http://127.0.0.1:1/";

struct StaticIssuer {
    reject: bool,
}

impl TokenIssuer for StaticIssuer {
    fn issue(&self, _credentials: &ServiceCredentials) -> Result<Credential, ProcessingError> {
        if self.reject {
            return Err(ProcessingError::Auth {
                status: 401,
                message: "invalid_client".to_string(),
            });
        }
        Ok(Credential {
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            created_at: chrono::Utc::now().timestamp(),
        })
    }
}

fn credentials() -> ServiceCredentials {
    ServiceCredentials {
        email: "worker@example.org".to_string(),
        password: "secret".to_string(),
        client_id: "client".to_string(),
    }
}

fn client(reject: bool) -> SpectraHttpClient<StaticIssuer> {
    let session = AuthSession::new(
        StaticIssuer { reject },
        credentials(),
        7000,
        RetryPolicy::SINGLE_ATTEMPT,
    );
    SpectraHttpClient::new(
        UNREACHABLE,
        Duration::from_secs(2),
        Arc::new(session),
        RetryPolicy::SINGLE_ATTEMPT,
    )
    .unwrap()
}

#[test]
fn spectrum_urls_follow_service_layout() {
    let client = client(false);
    assert_eq!(client.base_url(), "http://127.0.0.1:1");
    assert_eq!(
        client.spectrum_url(SpectrumId::new(7)),
        "http://127.0.0.1:1/api/v1/spectra/7"
    );
}

#[test]
fn file_urls_resolve_against_base() {
    assert_eq!(
        resolve_url("http://127.0.0.1:1", "/rails/active_storage/blobs/x/a.0.dpt"),
        "http://127.0.0.1:1/rails/active_storage/blobs/x/a.0.dpt"
    );
}

#[test]
fn unreachable_service_is_a_transport_failure() {
    let client = client(false);
    let err = client.get(SpectrumId::new(7)).unwrap_err();
    assert_matches!(err, ProcessingError::Transport(_));

    let err = client
        .patch_status(SpectrumId::new(7), ProcessingStatus::Ongoing)
        .unwrap_err();
    assert_matches!(err, ProcessingError::Transport(_));

    let err = client.download("/files/a.dat").unwrap_err();
    assert_matches!(err, ProcessingError::Transport(_));
}

#[test]
fn rejected_login_stops_before_the_request() {
    let client = client(true);
    let err = client.list().unwrap_err();
    assert_matches!(err, ProcessingError::Auth { status: 401, .. });
}

#[test]
fn post_reports_unreadable_file() {
    let client = client(false);
    let err = client
        .post(3, camino::Utf8Path::new("/nonexistent/spectrum.0.dpt"))
        .unwrap_err();
    assert_matches!(err, ProcessingError::Filesystem(_));
}

fn token_mock(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(POST)
            .path("/api/oauth/token")
            .x_www_form_urlencoded_tuple("email", "worker@example.org")
            .x_www_form_urlencoded_tuple("password", "secret")
            .x_www_form_urlencoded_tuple("grant_type", "password")
            .x_www_form_urlencoded_tuple("client_id", "client");
        then.status(200).json_body(json!({
            "access_token": "abc123",
            "refresh_token": "def456",
            "created_at": chrono::Utc::now().timestamp()
        }));
    })
}

fn served_client(server: &MockServer) -> SpectraHttpClient {
    let issuer = HttpTokenIssuer::new(&server.base_url(), Duration::from_secs(5)).unwrap();
    let session = AuthSession::new(issuer, credentials(), 7000, RetryPolicy::SINGLE_ATTEMPT);
    SpectraHttpClient::new(
        &server.base_url(),
        Duration::from_secs(5),
        Arc::new(session),
        RetryPolicy::SINGLE_ATTEMPT,
    )
    .unwrap()
}

#[test]
fn token_exchange_posts_password_grant() {
    let server = MockServer::start();
    let token = token_mock(&server);
    let issuer = HttpTokenIssuer::new(&server.base_url(), Duration::from_secs(5)).unwrap();

    let credential = issuer.issue(&credentials()).unwrap();
    token.assert_hits(1);
    assert_eq!(credential.access_token, "abc123");
    assert_eq!(credential.refresh_token, "def456");
}

#[test]
fn rejected_token_request_is_an_auth_failure() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/oauth/token");
        then.status(401).body("invalid_grant");
    });
    let issuer = HttpTokenIssuer::new(&server.base_url(), Duration::from_secs(5)).unwrap();

    let err = issuer.issue(&credentials()).unwrap_err();
    assert_matches!(err, ProcessingError::Auth { status: 401, ref message } if message == "invalid_grant");
}

#[test]
fn malformed_token_body_is_an_auth_failure() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/oauth/token");
        then.status(200).body("<html>maintenance</html>");
    });
    let issuer = HttpTokenIssuer::new(&server.base_url(), Duration::from_secs(5)).unwrap();

    let err = issuer.issue(&credentials()).unwrap_err();
    assert_matches!(err, ProcessingError::Auth { status: 200, .. });
}

#[test]
fn get_sends_bearer_token_and_reads_the_envelope() {
    let server = MockServer::start();
    let token = token_mock(&server);
    let record = server.mock(|when, then| {
        when.method(GET)
            .path("/api/v1/spectra/7")
            .header("authorization", "Bearer abc123");
        then.status(200).json_body(json!({
            "spectrum": {
                "id": 7,
                "file_url": "/files/7/soil.dat",
                "filename": "soil.dat",
                "format": "dat",
                "metadata": {}
            }
        }));
    });
    let client = served_client(&server);

    let first = client.get(SpectrumId::new(7)).unwrap();
    let second = client.get(SpectrumId::new(7)).unwrap();
    assert_eq!(first.filename, "soil.dat");
    assert_eq!(second.format.as_deref(), Some("dat"));
    record.assert_hits(2);
    token.assert_hits(1);
}

#[test]
fn missing_record_is_a_remote_status() {
    let server = MockServer::start();
    token_mock(&server);
    server.mock(|when, then| {
        when.method(GET).path("/api/v1/spectra/8");
        then.status(404).body("not found");
    });
    let client = served_client(&server);

    let err = client.get(SpectrumId::new(8)).unwrap_err();
    assert_matches!(err, ProcessingError::RemoteStatus { status: 404, .. });
}

#[test]
fn status_patch_is_a_form_field() {
    let server = MockServer::start();
    token_mock(&server);
    let patch = server.mock(|when, then| {
        when.method(PATCH)
            .path("/api/v1/spectra/7")
            .header("authorization", "Bearer abc123")
            .x_www_form_urlencoded_tuple("spectrum[status]", "ongoing");
        then.status(200);
    });
    let client = served_client(&server);

    client
        .patch_status(SpectrumId::new(7), ProcessingStatus::Ongoing)
        .unwrap();
    patch.assert_hits(1);
}

#[test]
fn metadata_patch_sends_json_text() {
    let server = MockServer::start();
    token_mock(&server);
    let patch = server.mock(|when, then| {
        when.method(PATCH)
            .path("/api/v1/spectra/7")
            .x_www_form_urlencoded_tuple(
                "spectrum[metadata]",
                r#"{"operator":"kim","peaks":[{"position":"22.22222222222222"}]}"#,
            );
        then.status(200);
    });
    let client = served_client(&server);

    let mut metadata = Map::new();
    metadata.insert("operator".to_string(), json!("kim"));
    metadata.insert(
        "peaks".to_string(),
        json!([{ "position": "22.22222222222222" }]),
    );
    client.patch_metadata(SpectrumId::new(7), &metadata).unwrap();
    patch.assert_hits(1);
}

#[test]
fn processed_file_is_a_named_multipart_part() {
    let server = MockServer::start();
    token_mock(&server);
    let patch = server.mock(|when, then| {
        when.method(PATCH)
            .path("/api/v1/spectra/7")
            .header("authorization", "Bearer abc123")
            .body_contains("name=\"spectrum[processed_file]\"")
            .body_contains("filename=\"soil.csv\"")
            .body_contains("0.0,100.0\n40.0,300.0\n");
        then.status(200);
    });
    let client = served_client(&server);

    let mut buffer = CanonicalBuffer::new("soil.csv", b"0.0,100.0\n40.0,300.0\n".to_vec());
    client
        .patch_processed_file(SpectrumId::new(7), &mut buffer)
        .unwrap();
    patch.assert_hits(1);
}

#[test]
fn post_sends_sample_and_file_parts() {
    let server = MockServer::start();
    token_mock(&server);
    let create = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v1/spectra")
            .header("authorization", "Bearer abc123")
            .body_contains("name=\"spectrum[sample_id]\"")
            .body_contains("name=\"spectrum[file]\"")
            .body_contains("filename=\"scan.0.dpt\"")
            .body_contains("400.0,0.1");
        then.status(201).json_body(json!({ "spectrum": { "id": 21 } }));
    });
    let client = served_client(&server);

    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("scan.0.dpt")).unwrap();
    std::fs::write(&path, "400.0,0.1\n401.0,0.2\n").unwrap();

    let created: Value = client.post(3, &path).unwrap();
    assert_eq!(created["spectrum"]["id"], json!(21));
    create.assert_hits(1);
}

#[test]
fn download_resolves_relative_url() {
    let server = MockServer::start();
    let token = token_mock(&server);
    let file = server.mock(|when, then| {
        when.method(GET).path("/files/7/soil.dat");
        then.status(200).body("Tracer 5i\n100\n300\n");
    });
    let client = served_client(&server);

    let bytes = client.download("/files/7/soil.dat").unwrap();
    assert_eq!(bytes, b"Tracer 5i\n100\n300\n");
    file.assert_hits(1);
    token.assert_hits(0);
}
