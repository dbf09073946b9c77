
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use framefarm::bus::{Headers, WORKER_EXCHANGE};
use framefarm::collab::ObjectStore;
use framefarm::gateway;
use framefarm::protocol::{WorkerCommand, WorkerId};
use framefarm::supervisor::JobStatus;
use test_harness::{assert_eventually, TestFarm, WAIT};

type WorkerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serve the worker gateway on an ephemeral port and return its URL
async fn serve_gateway(farm: &TestFarm) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = gateway::router(farm.bus.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws/worker")
}

async fn connect(url: &str) -> WorkerSocket {
    let (socket, _response) = connect_async(url).await.unwrap();
    socket
}

/// The id the gateway gave the only idle worker
async fn only_idle_worker(farm: &TestFarm) -> WorkerId {
    farm.wait_for_idle(1).await;
    farm.pool().await.idle.remove(0)
}

/// Next command written to the socket, skipping control frames
async fn next_command(socket: &mut WorkerSocket) -> WorkerCommand {
    loop {
        let message = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("no command reached the socket")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(socket: &mut WorkerSocket, value: serde_json::Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_socket_connect_adds_idle_worker() {
    let farm = TestFarm::new().await;
    let url = serve_gateway(&farm).await;

    let _first = connect(&url).await;
    farm.wait_for_idle(1).await;
    let _second = connect(&url).await;
    farm.wait_for_idle(2).await;

    let pool = farm.pool().await;
    assert_ne!(pool.idle[0], pool.idle[1]);
}

#[tokio::test]
async fn test_published_command_reaches_socket() {
    let farm = TestFarm::new().await;
    let url = serve_gateway(&farm).await;
    let mut socket = connect(&url).await;
    let worker_id = only_idle_worker(&farm).await;

    farm.bus
        .publish(
            WORKER_EXCHANGE,
            worker_id.as_str(),
            &WorkerCommand::StopWork {},
            Headers::new(),
        )
        .await
        .unwrap();

    assert_eq!(next_command(&mut socket).await, WorkerCommand::StopWork {});
}

#[tokio::test]
async fn test_socket_worker_renders_job_to_completion() {
    let farm = TestFarm::new().await;
    let url = serve_gateway(&farm).await;
    let mut socket = connect(&url).await;
    let worker_id = only_idle_worker(&farm).await;

    let job_id = farm.start_job(5, 6).await;
    let (scene_locator, frames) = loop {
        if let WorkerCommand::StartRendering {
            scene_locator,
            frames,
        } = next_command(&mut socket).await
        {
            break (scene_locator, frames);
        }
    };
    assert!(scene_locator.starts_with("scenes/"), "{scene_locator}");
    assert_eq!(frames, vec![5, 6]);

    // Garbage is logged and skipped without dropping the worker.
    socket
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();

    for frame in frames {
        let locator = format!("tmp/{worker_id}/{frame}.png");
        farm.objects
            .store(&farm.storage.upload_bucket, &locator, vec![frame as u8])
            .await
            .unwrap();
        send_json(
            &mut socket,
            json!({
                "topic": "frame-rendered",
                "data": {"frame": frame, "artifact_locator": locator}
            }),
        )
        .await;
    }

    farm.wait_for_status(job_id, JobStatus::Completed).await;
    assert_eq!(farm.status(job_id).await.rendered_frames, 2);
    assert_eq!(
        farm.objects.keys(&farm.storage.output_bucket).await.len(),
        2
    );
    assert_eq!(next_command(&mut socket).await, WorkerCommand::StopWork {});
}

#[tokio::test]
async fn test_disconnected_message_removes_worker() {
    let farm = TestFarm::new().await;
    let url = serve_gateway(&farm).await;
    let mut socket = connect(&url).await;
    farm.wait_for_idle(1).await;

    send_json(&mut socket, json!({"topic": "disconnected", "data": {}})).await;

    farm.wait_for_idle(0).await;
}

#[tokio::test]
async fn test_socket_close_removes_worker() {
    let farm = TestFarm::new().await;
    let url = serve_gateway(&farm).await;
    let mut socket = connect(&url).await;
    farm.wait_for_idle(1).await;

    socket.close(None).await.unwrap();

    farm.wait_for_idle(0).await;
}

#[tokio::test]
async fn test_dropped_socket_frees_assigned_frames() {
    let farm = TestFarm::new().await;
    let url = serve_gateway(&farm).await;
    let mut socket = connect(&url).await;
    farm.wait_for_idle(1).await;
    let job_id = farm.start_job(1, 3).await;
    next_command(&mut socket).await;
    farm.wait_for_status(job_id, JobStatus::Running).await;

    drop(socket);

    farm.wait_for_status(job_id, JobStatus::Initializing).await;
    assert_eventually(
        || async { farm.pool().await.assignments.is_empty() },
        WAIT,
        "lost worker should leave the pool",
    )
    .await;

    // A replacement socket picks the job back up from the start.
    let mut replacement = connect(&url).await;
    let frames = loop {
        if let WorkerCommand::StartRendering { frames, .. } =
            next_command(&mut replacement).await
        {
            break frames;
        }
    };
    assert_eq!(frames, vec![1, 2, 3]);
    farm.wait_for_status(job_id, JobStatus::Running).await;
}
