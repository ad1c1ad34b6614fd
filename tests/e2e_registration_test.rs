use anyhow::Result;
use axum::{http::StatusCode, routing::post, Router};
use device_pipeline::consumer::{DeviceConsumer, RetryPolicy};
use device_pipeline::domain::DeviceStatus;
use device_pipeline::gateway::RegistrationGateway;
use device_pipeline::infra::HttpIngestionClient;
use device_pipeline::queue::{InMemoryQueue, MessageQueue, SqliteQueue};
use device_pipeline::registry::{DeviceRegistry, InMemoryRegistrationStore, SqliteRegistrationStore};
use device_pipeline::server;
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

const QUEUE: &str = "device-registrations.v1";

fn registration_body() -> Value {
    json!({
        "hardwareId": "TEST-HW-1234",
        "model": "NB-Test-Model-1",
        "firmwareVersion": "0.0.1-test",
        "location": "lab-1",
        "initialTelemetry": { "battery": 98 }
    })
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base: Duration::from_millis(5),
        max: Duration::from_millis(20),
        jitter: Duration::ZERO,
    }
}

/// Serve the full registration API on an ephemeral loopback port.
fn spawn_api(gateway: RegistrationGateway, shutdown: watch::Receiver<bool>) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let mut rx = shutdown;
        let stop = async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = server::serve(listener, gateway, stop).await;
    });
    Ok(addr)
}

/// A downstream that answers 500 to every delivery and counts the calls.
fn spawn_broken_downstream(calls: Arc<AtomicUsize>) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let app = Router::new().route(
        "/ingest",
        post(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "downstream unavailable")
            }
        }),
    );
    tokio::spawn(async move {
        let _ = axum::Server::from_tcp(listener)
            .expect("adopt listener")
            .serve(app.into_make_service())
            .await;
    });
    Ok(addr)
}

async fn poll_until_terminal(client: &reqwest::Client, url: &str) -> Result<Value> {
    for _ in 0..200 {
        let resp = client.get(url).send().await?;
        if resp.status() == reqwest::StatusCode::OK {
            let record: Value = resp.json().await?;
            if record["status"] == "acknowledged" || record["status"] == "failed" {
                return Ok(record);
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    anyhow::bail!("device never reached a terminal status")
}

#[tokio::test]
async fn test_register_then_poll_until_acknowledged() -> Result<()> {
    let registry = DeviceRegistry::new(Arc::new(InMemoryRegistrationStore::new()));
    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryQueue::new());
    let (stop_tx, stop_rx) = watch::channel(false);

    let addr = spawn_api(
        RegistrationGateway::new(registry.clone(), Arc::clone(&queue)),
        stop_rx.clone(),
    )?;

    // The API's own mock endpoint plays the downstream ingestion system
    let ingestion = HttpIngestionClient::new(
        format!("http://{addr}/api/ingestion/mock"),
        Duration::from_secs(2),
    )?;
    let consumer = DeviceConsumer::new(registry.clone(), Arc::clone(&queue), Arc::new(ingestion))
        .with_policy(fast_policy())
        .with_poll_interval(Duration::from_millis(20));
    let worker = tokio::spawn(async move { consumer.run(stop_rx).await });

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/api/devices/register"))
        .json(&registration_body())
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    let accepted: Value = resp.json().await?;
    assert_eq!(accepted["status"], "pending");
    let device_id = accepted["deviceId"].as_str().unwrap_or_default().to_string();
    assert!(!device_id.is_empty());

    let record = poll_until_terminal(&client, &format!("http://{addr}/api/devices/{device_id}")).await?;
    assert_eq!(record["status"], "acknowledged");
    assert_eq!(record["attempts"], 1);
    assert_eq!(record["initialTelemetry"]["battery"], 98);
    assert!(record["lastError"].is_null());
    assert_eq!(record["ingestionResult"]["status"], "acknowledged");
    assert_eq!(record["ingestionResult"]["deviceId"], device_id.as_str());

    stop_tx.send(true)?;
    tokio::time::timeout(Duration::from_secs(5), worker).await??;
    Ok(())
}

#[tokio::test]
async fn test_persistent_downstream_failure_marks_failed() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let downstream = spawn_broken_downstream(Arc::clone(&calls))?;

    let registry = DeviceRegistry::new(Arc::new(InMemoryRegistrationStore::new()));
    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryQueue::new());
    let gateway = RegistrationGateway::new(registry.clone(), Arc::clone(&queue));

    let ingestion = HttpIngestionClient::new(format!("http://{downstream}/ingest"), Duration::from_secs(2))?;
    let consumer = DeviceConsumer::new(registry.clone(), Arc::clone(&queue), Arc::new(ingestion))
        .with_policy(fast_policy())
        .with_poll_interval(Duration::from_millis(10));
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run(stop_rx).await }
    });

    let accepted = gateway.register(&registration_body()).await?;

    let mut record = registry.get_registration(&accepted.device_id).await?;
    for _ in 0..200 {
        if record.status().is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        record = registry.get_registration(&accepted.device_id).await?;
    }

    assert_eq!(record.status(), DeviceStatus::Failed);
    assert_eq!(record.attempts(), 3);
    assert!(record.last_error().unwrap_or_default().contains("500"));

    // No further enqueue after the terminal failure
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.depth(QUEUE).await?, 0);
    assert_eq!(consumer.pending_retries(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    stop_tx.send(true)?;
    tokio::time::timeout(Duration::from_secs(5), worker).await??;
    Ok(())
}

#[tokio::test]
async fn test_gateway_and_consumer_share_sqlite_state() -> Result<()> {
    let dir = tempdir()?;

    // Separate handles on the same files, as a gateway and a consumer
    // process would have
    let gateway = RegistrationGateway::new(
        DeviceRegistry::new(Arc::new(SqliteRegistrationStore::open_at_root(dir.path())?)),
        Arc::new(SqliteQueue::open_at_root(dir.path(), None)?),
    );
    let worker_registry =
        DeviceRegistry::new(Arc::new(SqliteRegistrationStore::open_at_root(dir.path())?));
    let worker_queue: Arc<dyn MessageQueue> = Arc::new(SqliteQueue::open_at_root(dir.path(), None)?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let addr = spawn_api(gateway.clone(), stop_rx)?;
    let ingestion = HttpIngestionClient::new(
        format!("http://{addr}/api/ingestion/mock"),
        Duration::from_secs(2),
    )?;
    let consumer = DeviceConsumer::new(worker_registry.clone(), worker_queue, Arc::new(ingestion))
        .with_policy(fast_policy());

    let mut body = registration_body();
    body["deviceId"] = json!("sqlite-dev-1");
    let accepted = gateway.register(&body).await?;
    assert_eq!(
        worker_registry.get_registration("sqlite-dev-1").await?.status(),
        DeviceStatus::Queued
    );

    let mut outcome = consumer.poll_once().await?;
    for _ in 0..50 {
        if outcome != device_pipeline::consumer::PollOutcome::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        outcome = consumer.poll_once().await?;
    }
    assert_eq!(outcome, device_pipeline::consumer::PollOutcome::Acknowledged);

    let record = gateway.get_status(&accepted.device_id).await?;
    assert_eq!(record.status(), DeviceStatus::Acknowledged);
    assert_eq!(record.queue_message_id(), Some(accepted.queue_message_id));

    stop_tx.send(true)?;
    Ok(())
}
