//! HTTP Integration Tests for the action endpoints
//!
//! Check, preflight and record against an in-memory engine.

#[cfg(test)]
mod http_integration_tests {
    use actix_web::{App, test, web};
    use serde_json::{Value, json};

    use crate::handlers::configure_action_routes;
    use crate::handlers::test_support::test_app;
    use crate::services::{NotificationAction, NotificationChannel};

    macro_rules! init_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .service(web::scope("/v1").configure(configure_action_routes)),
            )
            .await
        };
    }

    fn failure(kind: &str) -> Value {
        json!({ "outcome": { "result": "failure", "kind": kind } })
    }

    #[actix_web::test]
    async fn test_check_allows_fresh_user() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/actions/message:check")
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 200);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["allowed"], true);
        assert!(body["data"]["limit"].as_u64().unwrap() > 0);
        assert!(body["meta"]["request_id"].is_string());
    }

    #[actix_web::test]
    async fn test_check_accepts_connection_request_alias() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/actions/connection_request:check")
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 200);
    }

    #[actix_web::test]
    async fn test_unknown_action_is_rejected() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/actions/teleport:check")
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 400);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[actix_web::test]
    async fn test_record_success_keeps_breaker_closed() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/actions/profile_view:record")
            .set_json(json!({ "outcome": { "result": "success" } }))
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 200);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["breaker"]["state"], "CLOSED");
        assert_eq!(body["data"]["breaker"]["actionClass"], "browsing");
        assert_eq!(body["data"]["transition"], "none");
        assert!(body["data"]["emergencyStop"].is_null());
    }

    #[actix_web::test]
    async fn test_record_rejects_malformed_outcome() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/actions/message:record")
            .set_json(failure("meteor_strike"))
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn test_repeated_failures_open_breaker_and_block_preflight() {
        let app = test_app();
        let service = init_app!(app.state);

        for _ in 0..5 {
            let req = test::TestRequest::post()
                .uri("/v1/users/u1/actions/message:record")
                .set_json(failure("transient"))
                .to_request();
            let resp = test::call_service(&service, req).await;
            assert_eq!(resp.status(), 200);
        }

        let req = test::TestRequest::get()
            .uri("/v1/users/u1/actions/message/preflight")
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 200);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["allowed"], false);
        assert_eq!(body["data"]["blockedBy"], "circuit_breaker");
        assert!(body["data"]["retryAfter"].as_u64().unwrap() > 0);

        // Other classes are unaffected
        let req = test::TestRequest::get()
            .uri("/v1/users/u1/actions/profile_view/preflight")
            .to_request();
        let body: Value = test::call_and_read_body_json(&service, req).await;
        assert_eq!(body["data"]["allowed"], true);

        assert_eq!(
            app.notifier
                .count(NotificationChannel::CircuitBreaker, NotificationAction::Opened),
            1
        );
    }

    #[actix_web::test]
    async fn test_suspension_signal_stops_user() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/actions/invitation:record")
            .set_json(failure("account_suspended"))
            .to_request();
        let body: Value = test::call_and_read_body_json(&service, req).await;
        assert_eq!(body["data"]["transition"], "escalation_required");
        assert_eq!(body["data"]["emergencyStop"]["manualResumeRequired"], true);
        assert_eq!(body["data"]["emergencyStop"]["reason"]["type"], "ACCOUNT_SUSPENSION");

        let req = test::TestRequest::get()
            .uri("/v1/users/u1/actions/like/preflight")
            .to_request();
        let body: Value = test::call_and_read_body_json(&service, req).await;
        assert_eq!(body["data"]["allowed"], false);
        assert_eq!(body["data"]["blockedBy"], "emergency_stop");
        assert!(body["data"]["retryAfter"].is_null());
    }

    #[actix_web::test]
    async fn test_platform_throttling_logs_violation() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/actions/comment:record")
            .set_json(failure("rate_limited"))
            .to_request();
        let body: Value = test::call_and_read_body_json(&service, req).await;
        assert_eq!(body["data"]["violation"]["type"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["data"]["breaker"]["failureCount"], 1);
    }
}
