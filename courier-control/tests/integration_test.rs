//! Client/server round trips over a real Unix socket.
#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::Signal;
use courier_control::{
    CommandHandler, ControlClient, ControlError, ControlServer, QueueCommand, Request,
    RequestCommand, Response, ResponseData, ResponsePayload, Result, SystemCommand,
    SystemStatus,
};
use courier_queue::{JobId, JobQueue, JobStats, NewJob};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Answers from an in-memory queue; anything else is refused.
struct QueueHandler {
    queue: JobQueue,
}

#[async_trait]
impl CommandHandler for QueueHandler {
    async fn handle_request(&self, request: Request) -> Result<Response> {
        match request.command {
            RequestCommand::System(SystemCommand::Ping) => Ok(Response::ok()),
            RequestCommand::System(SystemCommand::Status) => {
                Ok(Response::data(ResponseData::Status(SystemStatus {
                    version: "test".to_string(),
                    uptime_secs: 1,
                    queue_size: self.queue.len(),
                    stats: self.queue.stats(),
                })))
            }
            RequestCommand::Queue(QueueCommand::Stats) => {
                Ok(Response::data(ResponseData::Stats(self.queue.stats())))
            }
            RequestCommand::Queue(QueueCommand::Enqueue(new)) => {
                let id = self
                    .queue
                    .enqueue(*new)
                    .await
                    .map_err(|e| ControlError::Rejected(e.to_string()))?;
                Ok(Response::data(ResponseData::Created(id)))
            }
            RequestCommand::Queue(QueueCommand::View { id }) => Ok(Response::error(format!(
                "Job not found: {id}"
            ))),
            RequestCommand::Queue(QueueCommand::ProcessNow) => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Response::ok())
            }
            RequestCommand::Queue(_) => Ok(Response::error("not supported")),
        }
    }
}

struct TestServer {
    _dir: TempDir,
    socket: std::path::PathBuf,
    shutdown: broadcast::Sender<Signal>,
    handle: tokio::task::JoinHandle<Result<()>>,
    queue: JobQueue,
}

impl TestServer {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("control.sock");
        let queue = JobQueue::in_memory();
        let handler = Arc::new(QueueHandler {
            queue: queue.clone(),
        });

        let server = ControlServer::new(&socket, handler).unwrap();
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { server.serve(rx).await });
        wait_for_socket(&socket).await;

        Self {
            _dir: dir,
            socket,
            shutdown,
            handle,
            queue,
        }
    }

    fn client(&self) -> ControlClient {
        ControlClient::new(&self.socket)
    }
}

async fn wait_for_socket(path: &std::path::Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("control socket {} never appeared", path.display());
}

#[tokio::test]
async fn test_ping() {
    let server = TestServer::start().await;

    let response = server
        .client()
        .send_request(Request::system(SystemCommand::Ping))
        .await
        .unwrap();
    assert!(matches!(response.payload, ResponsePayload::Ok));
}

#[tokio::test]
async fn test_enqueue_then_stats() {
    let server = TestServer::start().await;
    let client = server.client();

    let new = NewJob::new("a@b.com", "Hello").text("Body");
    let response = client
        .send_request(Request::queue(QueueCommand::Enqueue(Box::new(new))))
        .await
        .unwrap();
    let ResponsePayload::Data(data) = response.payload else {
        panic!("expected data");
    };
    let ResponseData::Created(id) = *data else {
        panic!("expected created id");
    };
    assert!(server.queue.get(&id).is_ok());

    let response = client
        .send_request(Request::queue(QueueCommand::Stats))
        .await
        .unwrap();
    let ResponsePayload::Data(data) = response.payload else {
        panic!("expected data");
    };
    match *data {
        ResponseData::Stats(stats) => assert_eq!(
            stats,
            JobStats {
                pending: 1,
                ..JobStats::default()
            }
        ),
        other => panic!("expected stats, got {other:?}"),
    }
}

#[tokio::test]
async fn test_status() {
    let server = TestServer::start().await;

    let response = server
        .client()
        .send_request(Request::system(SystemCommand::Status))
        .await
        .unwrap();
    let ResponsePayload::Data(data) = response.payload else {
        panic!("expected data");
    };
    let ResponseData::Status(status) = *data else {
        panic!("expected status");
    };
    assert_eq!(status.queue_size, 0);
    assert_eq!(status.version, "test");
}

#[tokio::test]
async fn test_error_response_becomes_rejected() {
    let server = TestServer::start().await;
    let id = JobId::generate();

    let result = server
        .client()
        .send_request(Request::queue(QueueCommand::View { id }))
        .await;
    match result {
        Err(ControlError::Rejected(message)) => assert_eq!(message, format!("Job not found: {id}")),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_validation_error_reaches_client() {
    let server = TestServer::start().await;

    let result = server
        .client()
        .send_request(Request::queue(QueueCommand::Enqueue(Box::new(NewJob::new(
            "a@b.com", "No body",
        )))))
        .await;
    assert!(
        matches!(&result, Err(ControlError::Rejected(message)) if message.contains("body")),
        "{result:?}"
    );
    assert!(server.queue.is_empty());
}

#[tokio::test]
async fn test_version_mismatch_is_rejected() {
    let server = TestServer::start().await;

    let mut request = Request::system(SystemCommand::Ping);
    request.version = 99;
    let result = server.client().send_request(request).await;
    assert!(
        matches!(&result, Err(ControlError::Rejected(message)) if message.contains("v99")),
        "{result:?}"
    );
}

#[tokio::test]
async fn test_client_timeout() {
    let server = TestServer::start().await;

    let result = server
        .client()
        .with_timeout(Duration::from_millis(100))
        .send_request(Request::queue(QueueCommand::ProcessNow))
        .await;
    assert!(matches!(result, Err(ControlError::Timeout)));
}

#[tokio::test]
async fn test_socket_permissions_and_cleanup() {
    use std::os::unix::fs::PermissionsExt;

    let server = TestServer::start().await;
    // Connections are only accepted once permissions are in place.
    server
        .client()
        .send_request(Request::system(SystemCommand::Ping))
        .await
        .unwrap();

    let mode = std::fs::metadata(&server.socket)
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);

    server.shutdown.send(Signal::Shutdown).unwrap();
    server.handle.await.unwrap().unwrap();
    assert!(!server.socket.exists());
}

#[tokio::test]
async fn test_second_server_refused_while_first_running() {
    let server = TestServer::start().await;

    let second = ControlServer::new(
        &server.socket,
        Arc::new(QueueHandler {
            queue: JobQueue::in_memory(),
        }),
    )
    .unwrap();
    let (_tx, rx) = broadcast::channel(1);
    let result = second.serve(rx).await;
    assert!(
        matches!(&result, Err(ControlError::Io(e)) if e.kind() == std::io::ErrorKind::AddrInUse),
        "{result:?}"
    );

    // The running server is untouched.
    server
        .client()
        .send_request(Request::system(SystemCommand::Ping))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("control.sock");

    // A socket file nobody is listening on.
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let server = ControlServer::new(
        &socket,
        Arc::new(QueueHandler {
            queue: JobQueue::in_memory(),
        }),
    )
    .unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { server.serve(rx).await });

    let client = ControlClient::new(&socket);
    let mut response = None;
    for _ in 0..100 {
        if let Ok(r) = client.send_request(Request::system(SystemCommand::Ping)).await {
            response = Some(r);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(response.is_some_and(|r| r.is_success()));

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap().unwrap();
}

#[test]
fn test_empty_socket_path_rejected() {
    let result = ControlServer::new(
        "",
        Arc::new(QueueHandler {
            queue: JobQueue::in_memory(),
        }),
    );
    assert!(matches!(result, Err(ControlError::InvalidSocketPath(_))));
}
