//! HTTP Integration Tests for the emergency stop endpoints

#[cfg(test)]
mod http_integration_tests {
    use actix_web::{App, test, web};
    use chrono::Duration;
    use serde_json::{Value, json};

    use crate::handlers::configure_emergency_routes;
    use crate::handlers::test_support::test_app;
    use crate::models::{ActionOutcome, ActionType, FailureKind};
    use crate::services::{NotificationAction, NotificationChannel};

    macro_rules! init_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .service(web::scope("/v1").configure(configure_emergency_routes)),
            )
            .await
        };
    }

    fn manual_stop() -> Value {
        json!({
            "reason": {
                "type": "MANUAL",
                "severity": "HIGH",
                "description": "account owner asked to pause"
            },
            "triggeredBy": "ops@example.com"
        })
    }

    fn timed_stop(minutes: u32) -> Value {
        json!({
            "reason": {
                "type": "RATE_LIMIT_ABUSE",
                "severity": "MEDIUM",
                "description": "cooling down",
                "autoResumeAfterMinutes": minutes
            },
            "triggeredBy": "scheduler"
        })
    }

    #[actix_web::test]
    async fn test_status_without_stop() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::get()
            .uri("/v1/users/u1/emergency-stop")
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 200);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["active"], false);
        assert!(body["data"]["stop"].is_null());
    }

    #[actix_web::test]
    async fn test_trigger_then_manual_resume() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:trigger")
            .set_json(manual_stop())
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 201);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["manualResumeRequired"], true);
        assert!(body["data"]["estimatedResumeTime"].is_null());

        let req = test::TestRequest::get()
            .uri("/v1/users/u1/emergency-stop")
            .to_request();
        let body: Value = test::call_and_read_body_json(&service, req).await;
        assert_eq!(body["data"]["active"], true);
        assert_eq!(body["data"]["stop"]["reason"]["type"], "MANUAL");

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:resume")
            .set_json(json!({ "requestedBy": "ops@example.com", "notes": "owner confirmed" }))
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["userId"], "u1");

        let req = test::TestRequest::get()
            .uri("/v1/users/u1/emergency-stop")
            .to_request();
        let body: Value = test::call_and_read_body_json(&service, req).await;
        assert_eq!(body["data"]["active"], false);

        assert_eq!(
            app.notifier
                .count(NotificationChannel::EmergencyStop, NotificationAction::Resumed),
            1
        );
    }

    #[actix_web::test]
    async fn test_automated_actor_cannot_lift_manual_stop() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:trigger")
            .set_json(manual_stop())
            .to_request();
        test::call_service(&service, req).await;

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:resume")
            .set_json(json!({ "requestedBy": "scheduler" }))
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 409);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "STATE_CONFLICT");
        assert!(body["error"]["message"].as_str().unwrap().contains("manual resume required"));
    }

    #[actix_web::test]
    async fn test_resume_without_stop_conflicts() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:resume")
            .set_json(json!({ "requestedBy": "ops@example.com" }))
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 409);
    }

    #[actix_web::test]
    async fn test_resume_refused_while_failures_are_high() {
        let app = test_app();
        let service = init_app!(app.state);

        for _ in 0..5 {
            app.state
                .engine
                .record_outcome("u1", ActionType::Message, ActionOutcome::Failure(FailureKind::Transient))
                .await
                .unwrap();
        }

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:trigger")
            .set_json(manual_stop())
            .to_request();
        test::call_service(&service, req).await;

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:resume")
            .set_json(json!({ "requestedBy": "ops@example.com" }))
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 422);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "SAFETY_CHECK_FAILED");
    }

    #[actix_web::test]
    async fn test_trigger_validation() {
        let app = test_app();
        let service = init_app!(app.state);

        let mut body = manual_stop();
        body["reason"]["description"] = json!("  ");
        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:trigger")
            .set_json(body)
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 400);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:trigger")
            .set_json(timed_stop(0))
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn test_timed_stop_lifts_after_deadline() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:trigger")
            .set_json(timed_stop(30))
            .to_request();
        let body: Value = test::call_and_read_body_json(&service, req).await;
        assert_eq!(body["data"]["manualResumeRequired"], false);

        app.clock.advance(Duration::minutes(31));

        let req = test::TestRequest::get()
            .uri("/v1/users/u1/emergency-stop")
            .to_request();
        let body: Value = test::call_and_read_body_json(&service, req).await;
        assert_eq!(body["data"]["active"], false);
    }

    #[actix_web::test]
    async fn test_history_lists_stops_and_resumes() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:trigger")
            .set_json(manual_stop())
            .to_request();
        test::call_service(&service, req).await;

        let req = test::TestRequest::post()
            .uri("/v1/users/u1/emergency-stop:resume")
            .set_json(json!({ "requestedBy": "ops@example.com" }))
            .to_request();
        test::call_service(&service, req).await;

        let req = test::TestRequest::get()
            .uri("/v1/users/u1/emergency-stop/history?limit=10")
            .to_request();
        let body: Value = test::call_and_read_body_json(&service, req).await;
        assert_eq!(body["data"]["stops"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["stops"][0]["reasonType"], "MANUAL");
        assert_eq!(body["data"]["resumes"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["resumes"][0]["requestedBy"], "ops@example.com");
    }

    #[actix_web::test]
    async fn test_system_wide_stop_dedupes_users() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/emergency-stop:system-wide")
            .set_json(json!({
                "reason": {
                    "type": "SYSTEM_WIDE",
                    "severity": "CRITICAL",
                    "description": "platform incident"
                },
                "triggeredBy": "ops@example.com",
                "affectedUsers": ["a", "b", "a"]
            }))
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 200);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["affectedUsers"], 2);
        assert_eq!(body["data"]["succeeded"], 2);
        assert_eq!(body["data"]["failed"].as_array().unwrap().len(), 0);
        assert_eq!(
            app.notifier
                .count(NotificationChannel::Fleet, NotificationAction::Triggered),
            1
        );
    }

    #[actix_web::test]
    async fn test_system_wide_stop_requires_users() {
        let app = test_app();
        let service = init_app!(app.state);

        let req = test::TestRequest::post()
            .uri("/v1/emergency-stop:system-wide")
            .set_json(json!({
                "reason": {
                    "type": "SYSTEM_WIDE",
                    "severity": "CRITICAL",
                    "description": "platform incident"
                },
                "triggeredBy": "ops@example.com",
                "affectedUsers": []
            }))
            .to_request();
        let resp = test::call_service(&service, req).await;
        assert_eq!(resp.status(), 400);
    }
}
