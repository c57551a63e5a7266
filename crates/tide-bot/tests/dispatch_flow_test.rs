//! End-to-end dispatch tests over HTTP.
//!
//! Tests the dispatch pipeline against a local webhook server:
//! - Routing with mirroring
//! - Retry on recoverable statuses
//! - Fallback URL with simplified payload
//! - Cascade detection and delivery
//! - The HTTP API

mod integration;
use integration::common::mock_webhook::MockWebhookServer;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tide_bot::{AppConfig, Application};
use tide_core::{AlertEnvelope, AlertLevel, DispatchOutcome, Side, SystemClock};
use tide_delivery::{DeliveryOutcome, DeliveryStage, Transport, WebhookTransport};
use tokio::time::timeout;

fn config_for(server: &MockWebhookServer) -> AppConfig {
    let toml = format!(
        r#"
[delivery]
max_retries = 3
initial_delay_ms = 10
max_delay_ms = 50
attempt_timeout_secs = 5

[routing]
default_destination = "main"

[routing.destinations.main]
url = "{main}"

[routing.destinations.whales]
url = "{whales}"

[routing.destinations.liquidations]
url = "{liquidations}"
fallback_url = "{backup}"

[routing.rules.whale_activity]
destination = "whales"
mirror = true

[routing.rules.liquidation]
destination = "liquidations"

[api]
enabled = false
"#,
        main = server.url("main"),
        whales = server.url("whales"),
        liquidations = server.url("liquidations"),
        backup = server.url("backup"),
    );
    AppConfig::from_toml(&toml).unwrap()
}

fn application(config: AppConfig) -> Application {
    let transport: Arc<dyn Transport> =
        Arc::new(WebhookTransport::new(4, Duration::from_secs(2)).unwrap());
    Application::with_parts(config, SystemClock::shared(), transport).unwrap()
}

/// Mirrored categories reach both their own and the default destination.
#[tokio::test]
async fn test_mirrored_delivery_over_http() {
    let server = MockWebhookServer::start().await;
    let app = application(config_for(&server));
    let dispatcher = app.dispatcher();

    let envelope = AlertEnvelope::new(
        "whale_activity",
        AlertLevel::Info,
        json!({"content": "whale bought 500 BTC"}),
    )
    .with_entity("BTC");
    let result = dispatcher.submit(envelope).await;

    assert_eq!(
        result.outcome,
        DispatchOutcome::Sent {
            delivered: 2,
            failed: 0
        }
    );
    assert_eq!(server.received_for("whales").await.len(), 1);
    let main = server.received_for("main").await;
    assert_eq!(main.len(), 1);
    assert_eq!(main[0].body["content"], "whale bought 500 BTC");

    server.shutdown().await;
}

/// Recoverable statuses are retried with backoff until success.
#[tokio::test]
async fn test_retry_until_success() {
    let server = MockWebhookServer::start().await;
    server.script("main", &[503, 429]).await;
    let app = application(config_for(&server));

    let envelope = AlertEnvelope::new("system", AlertLevel::Warning, json!({"content": "lag"}));
    let result = app.dispatcher().submit(envelope).await;

    assert!(result.outcome.is_sent());
    let report = &result.deliveries[0];
    assert_eq!(report.outcome, DeliveryOutcome::Delivered);
    assert_eq!(report.attempts(), 3);
    assert_eq!(
        report.backoff_delays,
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
    assert_eq!(server.received_for("main").await.len(), 3);

    let stats = app.dispatcher().get_stats();
    assert_eq!(stats.delivery.retries, 2);

    server.shutdown().await;
}

/// A non-recoverable status stops retries; the fallback URL gets a simplified payload.
#[tokio::test]
async fn test_fallback_url_receives_simplified_payload() {
    let server = MockWebhookServer::start().await;
    server.script("liquidations", &[400]).await;
    let app = application(config_for(&server));

    let envelope = AlertEnvelope::new(
        "liquidation",
        AlertLevel::Info,
        json!({"embeds": [{"title": "ETH long liquidated", "fields": [{"name": "size", "value": "$80k"}]}]}),
    )
    .with_entity("ETH");
    let result = app.dispatcher().submit(envelope).await;

    assert!(result.outcome.is_sent());
    let report = &result.deliveries[0];
    assert_eq!(report.outcome, DeliveryOutcome::DeliveredViaFallback);
    assert_eq!(report.attempts(), 2);
    assert_eq!(report.records[1].stage, DeliveryStage::Fallback);

    assert_eq!(server.received_for("liquidations").await.len(), 1);
    let backup = server.received_for("backup").await;
    assert_eq!(backup.len(), 1);
    assert_eq!(backup[0].body, json!({"content": "ETH long liquidated"}));

    server.shutdown().await;
}

/// Every destination failing yields `Errors`, and the failure is recorded.
#[tokio::test]
async fn test_all_destinations_failing() {
    let server = MockWebhookServer::start().await;
    server.script("main", &[500, 500, 500]).await;
    let app = application(config_for(&server));
    let dispatcher = app.dispatcher();

    let envelope = AlertEnvelope::new("system", AlertLevel::Critical, json!({"content": "down"}));
    let result = dispatcher.submit(envelope).await;

    assert_eq!(result.outcome, DispatchOutcome::Errors { failed: 1 });
    assert_eq!(result.deliveries[0].outcome, DeliveryOutcome::RetriesExhausted);

    let records = dispatcher
        .store()
        .query(&tide_persistence::RecordFilter::default())
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failed_to, vec!["main".to_string()]);

    server.shutdown().await;
}

/// Liquidations accumulate into one cascade alert delivered to the default destination.
#[tokio::test]
async fn test_cascade_delivered_once() {
    let server = MockWebhookServer::start().await;
    let app = application(config_for(&server));
    let dispatcher = app.dispatcher();

    let mut cascades = 0;
    for (usd, side) in [
        (600_000.0, Side::Sell),
        (300_000.0, Side::Sell),
        (250_000.0, Side::Sell),
        (100_000.0, Side::Buy),
    ] {
        let envelope = AlertEnvelope::new(
            "liquidation",
            AlertLevel::Info,
            json!({"content": format!("liquidated ${usd}")}),
        )
        .with_entity("SOL")
        .with_metric(usd, side, 150.0);
        cascades += dispatcher.submit(envelope).await.cascades.len();
    }
    assert_eq!(cascades, 1);

    let main = server.received_for("main").await;
    assert_eq!(main.len(), 1);
    let cascade = &main[0].body["cascade"];
    assert_eq!(cascade["scope"], "SOL");
    assert_eq!(cascade["event_count"], 3);
    assert_eq!(cascade["dominance"], "SHORT");

    // Direct deliveries: the first one, then the per-entity cooldown holds.
    assert_eq!(server.received_for("liquidations").await.len(), 1);
    assert_eq!(dispatcher.get_stats().dispatch.cascades, 1);

    server.shutdown().await;
}

/// The HTTP API accepts alerts and reports stats while `Application::run` is active.
#[tokio::test]
async fn test_api_end_to_end() {
    let server = MockWebhookServer::start().await;
    let mut config = config_for(&server);
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    config.api.enabled = true;
    config.api.port = port;

    let app = application(config);
    let token = app.cancellation_token();
    let handle = tokio::spawn(app.run());

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");

    let ready = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(response) = client.get(format!("{base}/health")).send().await {
                if response.status().is_success() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(ready.is_ok(), "API should come up within timeout");

    for _ in 0..2 {
        let response = client
            .post(format!("{base}/api/alerts"))
            .json(&json!({
                "category": "system",
                "level": "critical",
                "payload": {"content": "manual alert"}
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }
    assert_eq!(server.received_for("main").await.len(), 2);

    let stats: Value = client
        .get(format!("{base}/api/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["dispatch"]["submitted"], 2);
    assert_eq!(stats["dispatch"]["throttled"], 0);

    let records: Value = client
        .get(format!("{base}/api/alerts?outcome=sent"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(records.as_array().map(Vec::len), Some(2));

    token.cancel();
    handle.await.unwrap().unwrap();
    server.shutdown().await;
}
