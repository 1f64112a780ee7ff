//! Owner notification channels against mock HTTP endpoints

use serde_json::Value;
use warden::Severity;
use warden::config::{Alert, Discord, Webhook};
use warden::hub::notify::{AlertDispatcher, LogNotifier, Notifier};
use warden::hub::{Identity, Target};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::test_alert;

fn target() -> Target {
    Target {
        identity: Identity::new("web-1"),
        name: String::from("web"),
    }
}

async fn only_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    serde_json::from_slice(&requests[0].body).unwrap()
}

#[tokio::test]
async fn test_webhook_posts_alert() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let dispatcher = AlertDispatcher::new(Alert::Webhook(Webhook {
        url: format!("{}/hook", mock_server.uri()),
    }));
    dispatcher
        .notify_owners(&target(), &test_alert())
        .await
        .unwrap();

    let body = only_body(&mock_server).await;
    assert_eq!(body["type"], "cpu");
    assert_eq!(body["level"], "warning");
    assert_eq!(body["server"], "web");
    assert_eq!(body["server_id"], "web-1");
    assert_eq!(
        body["message"],
        "[warning] web: CPU usage is 92.5% (threshold: 80.0%)"
    );
}

#[tokio::test]
async fn test_webhook_failure_is_reported() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let dispatcher = AlertDispatcher::new(Alert::Webhook(Webhook {
        url: mock_server.uri(),
    }));

    assert!(
        dispatcher
            .notify_owners(&target(), &test_alert())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_discord_embed_and_mention() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/webhooks/1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let dispatcher = AlertDispatcher::new(Alert::Discord(Discord {
        url: format!("{}/api/webhooks/1", mock_server.uri()),
        user_id: Some(String::from("1234")),
    }));
    let mut alert = test_alert();
    alert.level = Severity::Critical;
    dispatcher.notify_owners(&target(), &alert).await.unwrap();

    let body = only_body(&mock_server).await;
    assert!(body["content"].as_str().unwrap().ends_with("<@1234>"));
    assert_eq!(body["embeds"][0]["color"], 15158332);
    assert_eq!(body["embeds"][0]["title"], "🔴 CPU alert");
}

#[tokio::test]
async fn test_discord_without_user_has_no_content() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let dispatcher = AlertDispatcher::new(Alert::Discord(Discord {
        url: mock_server.uri(),
        user_id: None,
    }));
    dispatcher
        .notify_owners(&target(), &test_alert())
        .await
        .unwrap();

    let body = only_body(&mock_server).await;
    assert!(body.get("content").is_none());
    assert_eq!(body["embeds"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_log_notifier_always_succeeds() {
    assert!(
        LogNotifier
            .notify_owners(&target(), &test_alert())
            .await
            .is_ok()
    );
}
