mod common;

use common::*;
use marketplace_auth::auth::{AuthService, Destination};
use marketplace_auth::error::AuthError;
use marketplace_auth::notify::{
    DeliverabilityValidator, FlaggedValidator, HttpDeliverabilityValidator,
};
use marketplace_auth::AppError;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn deliverability_api(path_suffix: &str, deliverable: bool) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(path_suffix))
        .and(header("X-Api-Key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deliverable": deliverable })))
        .mount(&server)
        .await;
    server
}

fn validator(server: &MockServer) -> HttpDeliverabilityValidator {
    HttpDeliverabilityValidator::new(&server.uri(), Some("test-key".into())).unwrap()
}

#[tokio::test]
async fn test_email_lookup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/email"))
        .and(query_param("address", "pm@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deliverable": true })))
        .expect(1)
        .mount(&server)
        .await;

    assert!(validator(&server)
        .validate_email("pm@example.com")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_base_path_prefix_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/phone"))
        .and(query_param("number", "+15551234567"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deliverable": true })))
        .expect(2)
        .mount(&server)
        .await;

    for base in [format!("{}/api", server.uri()), format!("{}/api/", server.uri())] {
        let validator = HttpDeliverabilityValidator::new(&base, None).unwrap();
        assert!(validator.validate_phone("+15551234567").await.unwrap());
    }
}

#[tokio::test]
async fn test_malformed_destination_skips_lookup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deliverable": true })))
        .expect(0)
        .mount(&server)
        .await;

    let validator = validator(&server);
    assert!(!validator.validate_email("not-an-address").await.unwrap());
    assert!(!validator.validate_phone("5551234").await.unwrap());
}

#[tokio::test]
async fn test_api_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/phone"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    tokio_test::assert_err!(validator(&server).validate_phone("+15551234567").await);
}

#[tokio::test]
async fn test_undeliverable_phone_is_invalid_destination() {
    let server = deliverability_api("/v1/phone", false).await;
    let validator = FlaggedValidator::new(Arc::new(validator(&server)), false, true);
    let app = test_app_with(settings(), Arc::new(MockNotifier::new()), Arc::new(validator));
    let service = AuthService::property_manager(&app.ctx);

    let err = service
        .request_verification_code(
            &Destination::phone("+15551234567"),
            None,
            "1.1.1.1",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::AuthError(AuthError::InvalidDestination(_))
    ));
}

#[tokio::test]
async fn test_unreachable_api_is_external_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let validator = FlaggedValidator::new(Arc::new(validator(&server)), true, false);
    let app = test_app_with(settings(), Arc::new(MockNotifier::new()), Arc::new(validator));
    let service = AuthService::property_manager(&app.ctx);

    let err = service
        .request_verification_code(
            &Destination::email("pm@example.com"),
            None,
            "1.1.1.1",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::AuthError(AuthError::ExternalServiceFailure(_))
    ));
}

#[tokio::test]
async fn test_disabled_check_skips_api() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    let validator = FlaggedValidator::new(Arc::new(validator(&server)), false, false);

    let mut notifier = MockNotifier::new();
    notifier
        .expect_send_email()
        .withf(|to, _, body| to == "pm@example.com" && body.contains("verification code"))
        .times(1)
        .returning(|_, _, _| Ok(()));
    let app = test_app_with(settings(), Arc::new(notifier), Arc::new(validator));
    let service = AuthService::property_manager(&app.ctx);

    service
        .request_verification_code(
            &Destination::email("PM@example.com"),
            None,
            "1.1.1.1",
        )
        .await
        .unwrap();
}
