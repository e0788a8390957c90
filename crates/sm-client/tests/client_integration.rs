//! Reconnecting client tests against an in-process stub server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use sm_client::{BackoffConfig, ClientConfig, ClientError, ConnectionState, ReconnectingClient};
use sm_core::events::{ExitPayload, SessionEvent};
use sm_core::rpc::{RpcCall, RpcRequest, RpcResponse, ServerMessage};

#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Answer every request
    Echo,
    /// Read requests, never answer
    Silent,
    /// Close the connection on the first request
    DropOnRequest,
    /// Close the first connection on its first request, answer on later ones
    DropFirstConnection,
    /// Push an exit event before each response
    EventBeforeReply,
}

struct StubServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl StubServer {
    async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&connections);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, behavior, index));
            }
        });

        Self {
            addr,
            connections,
            task,
        }
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, behavior: Behavior, index: usize) {
    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new());
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    while let Some(Ok(line)) = lines.next().await {
        let request: RpcRequest = serde_json::from_str(&line).unwrap();

        match behavior {
            Behavior::Silent => continue,
            Behavior::DropOnRequest => return,
            Behavior::DropFirstConnection if index == 0 => return,
            Behavior::EventBeforeReply => {
                let event = SessionEvent::Exit {
                    session_id: "s1".to_string(),
                    payload: ExitPayload {
                        exit_code: Some(0),
                        timestamp: 1,
                    },
                };
                let line = ServerMessage::Event(event.to_envelope().unwrap())
                    .to_line()
                    .unwrap();
                writer.send(line).await.unwrap();
            }
            _ => {}
        }

        let result = if request.method == "server.ping" {
            json!("pong")
        } else {
            json!({ "method": request.method })
        };
        let line = ServerMessage::Response(RpcResponse::ok(request.id, result))
            .to_line()
            .unwrap();
        if writer.send(line).await.is_err() {
            return;
        }
    }
}

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        address: addr.to_string(),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        backoff: BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: 0.0,
        },
    }
}

async fn wait_for_state(client: &ReconnectingClient, predicate: impl Fn(&ConnectionState) -> bool) {
    let mut state = client.watch_state();
    tokio::time::timeout(Duration::from_secs(3), state.wait_for(|s| predicate(s)))
        .await
        .expect("state not reached in time")
        .unwrap();
}

#[tokio::test]
async fn test_ping_roundtrip() {
    let server = StubServer::start(Behavior::Echo).await;
    let client = ReconnectingClient::new(config(server.addr));

    // Issued before the connection is up; waits for it
    client.ping().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    let value = client.request(RpcCall::List).await.unwrap();
    assert_eq!(value["method"], "session.list");

    client.close().await;
}

#[tokio::test]
async fn test_connection_timeout_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = config(addr);
    config.connect_timeout = Duration::from_millis(200);
    config.backoff.initial = Duration::from_millis(50);
    let client = ReconnectingClient::new(config);

    let started = Instant::now();
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionTimeout(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));

    client.close().await;
}

#[tokio::test]
async fn test_in_flight_request_rejected_on_disconnect() {
    let server = StubServer::start(Behavior::DropOnRequest).await;
    let client = ReconnectingClient::new(config(server.addr));

    let started = Instant::now();
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost), "got {err:?}");
    // Rejected on disconnect, not after the request timeout
    assert!(started.elapsed() < Duration::from_secs(2));

    client.close().await;
}

#[tokio::test]
async fn test_request_timeout() {
    let server = StubServer::start(Behavior::Silent).await;
    let mut config = config(server.addr);
    config.request_timeout = Duration::from_millis(200);
    let client = ReconnectingClient::new(config);

    let err = client.ping().await.unwrap_err();
    match err {
        ClientError::RequestTimeout { method, timeout } => {
            assert_eq!(method, "server.ping");
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("expected a request timeout, got {other:?}"),
    }

    // The connection itself is still usable
    assert_eq!(client.state(), ConnectionState::Connected);

    client.close().await;
}

#[tokio::test]
async fn test_reconnects_after_drop() {
    let server = StubServer::start(Behavior::DropFirstConnection).await;
    let client = ReconnectingClient::new(config(server.addr));
    let mut states = client.watch_state();

    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost), "got {err:?}");

    tokio::time::timeout(
        Duration::from_secs(3),
        states.wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. })),
    )
    .await
    .expect("never started reconnecting")
    .unwrap();

    wait_for_state(&client, ConnectionState::is_connected).await;
    client.ping().await.unwrap();
    assert_eq!(server.connections(), 2);

    client.close().await;
}

#[tokio::test]
async fn test_close_rejects_requests() {
    let server = StubServer::start(Behavior::Echo).await;
    let client = ReconnectingClient::new(config(server.addr));
    client.ping().await.unwrap();

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);

    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, ClientError::ClientClosed), "got {err:?}");

    // Closing twice is harmless
    client.close().await;
    assert!(client.state().is_closed());
}

#[tokio::test]
async fn test_pending_request_rejected_on_close() {
    let server = StubServer::start(Behavior::Silent).await;
    let client = Arc::new(ReconnectingClient::new(config(server.addr)));
    wait_for_state(&client, ConnectionState::is_connected).await;

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.ping().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.close().await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::ClientClosed), "got {err:?}");
}

#[tokio::test]
async fn test_events_are_decoded() {
    let server = StubServer::start(Behavior::EventBeforeReply).await;
    let client = ReconnectingClient::new(config(server.addr));
    let mut events = client.subscribe_events();

    client.ping().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        SessionEvent::Exit {
            session_id,
            payload,
        } => {
            assert_eq!(session_id, "s1");
            assert_eq!(payload.exit_code, Some(0));
        }
        other => panic!("unexpected event {other:?}"),
    }

    client.close().await;
}
