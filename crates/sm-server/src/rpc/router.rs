//! Subscription router
//!
//! A single task owns every connection's subscription state and outbound
//! queue. Connections register, subscribe and unsubscribe by message; session
//! events from the manager are fanned out to the interested connections.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use sm_core::events::{OutputPayload, SessionEvent};
use sm_core::rpc::{ServerMessage, SubscribeAck, SubscribeParams, UnsubscribeParams};
use sm_core::time::current_time_millis;

use crate::session::SessionManager;

/// Identifies one client connection
pub type ConnectionId = u64;

/// Router task has stopped
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Subscription router is not running")]
pub struct RouterClosed;

/// What one connection wants to hear about
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub session_ids: HashSet<String>,
    pub subscribe_all: bool,
    /// Backfill size of the most recent subscribe
    pub replay_lines: usize,
}

impl SubscriptionState {
    /// Whether an event routed by `session_id` reaches this connection.
    /// Events without a session go to everyone.
    pub fn should_receive(&self, session_id: Option<&str>) -> bool {
        match session_id {
            None => true,
            Some(id) => self.subscribe_all || self.session_ids.contains(id),
        }
    }

    fn ack(&self, replayed: usize) -> SubscribeAck {
        let mut sessions: Vec<String> = self.session_ids.iter().cloned().collect();
        sessions.sort();
        SubscribeAck {
            sessions,
            all: self.subscribe_all,
            replayed,
        }
    }
}

enum RouterCommand {
    Register {
        connection: ConnectionId,
        outbound: mpsc::Sender<String>,
    },
    Unregister {
        connection: ConnectionId,
    },
    Subscribe {
        connection: ConnectionId,
        params: SubscribeParams,
        reply: oneshot::Sender<Backfill>,
    },
    Unsubscribe {
        connection: ConnectionId,
        params: UnsubscribeParams,
        reply: oneshot::Sender<SubscribeAck>,
    },
}

/// Replay lines for one subscribe, delivered by the requesting task
struct Backfill {
    ack: SubscribeAck,
    lines: Vec<String>,
    outbound: Option<mpsc::Sender<String>>,
}

/// Cloneable handle for talking to the router task
#[derive(Clone)]
pub struct RouterHandle {
    commands: mpsc::UnboundedSender<RouterCommand>,
}

impl RouterHandle {
    /// Start routing a connection's traffic through `outbound`
    pub fn register(&self, connection: ConnectionId, outbound: mpsc::Sender<String>) {
        self.send(RouterCommand::Register {
            connection,
            outbound,
        });
    }

    /// Forget a connection and its subscriptions
    pub fn unregister(&self, connection: ConnectionId) {
        self.send(RouterCommand::Unregister { connection });
    }

    /// Merge targets into the connection's subscription.
    ///
    /// Any requested backfill has been queued on the connection by the time
    /// this returns. Backfill waits for room on this connection's queue only;
    /// the router keeps serving everyone else meanwhile.
    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        params: SubscribeParams,
    ) -> Result<SubscribeAck, RouterClosed> {
        let (reply, backfill) = oneshot::channel();
        self.commands
            .send(RouterCommand::Subscribe {
                connection,
                params,
                reply,
            })
            .map_err(|_| RouterClosed)?;
        let Backfill {
            mut ack,
            lines,
            outbound,
        } = backfill.await.map_err(|_| RouterClosed)?;

        if let Some(outbound) = outbound {
            for line in lines {
                if outbound.send(line).await.is_err() {
                    tracing::debug!(connection, "Connection closed during replay");
                    break;
                }
                ack.replayed += 1;
            }
        }
        Ok(ack)
    }

    pub async fn unsubscribe(
        &self,
        connection: ConnectionId,
        params: UnsubscribeParams,
    ) -> Result<SubscribeAck, RouterClosed> {
        let (reply, ack) = oneshot::channel();
        self.commands
            .send(RouterCommand::Unsubscribe {
                connection,
                params,
                reply,
            })
            .map_err(|_| RouterClosed)?;
        ack.await.map_err(|_| RouterClosed)
    }

    fn send(&self, command: RouterCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Subscription router stopped, dropping command");
        }
    }
}

struct Connection {
    outbound: mpsc::Sender<String>,
    state: SubscriptionState,
}

/// Fan-out task state
pub struct SubscriptionRouter {
    manager: SessionManager,
    connections: HashMap<ConnectionId, Connection>,
}

/// Start the router task fed by the manager's event stream
pub fn spawn_router(
    manager: SessionManager,
    events: mpsc::UnboundedReceiver<SessionEvent>,
) -> (RouterHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let router = SubscriptionRouter {
        manager,
        connections: HashMap::new(),
    };
    let task = tokio::spawn(router.run(commands_rx, events));
    (
        RouterHandle {
            commands: commands_tx,
        },
        task,
    )
}

impl SubscriptionRouter {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RouterCommand>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let mut events_open = true;

        loop {
            tokio::select! {
                // Subscription changes apply before any later event
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.fan_out(&event),
                    None => {
                        tracing::debug!("Session event stream closed");
                        events_open = false;
                    }
                },
            }
        }

        tracing::debug!("Subscription router exiting");
    }

    fn handle_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Register {
                connection,
                outbound,
            } => {
                tracing::debug!(connection, "Connection registered");
                self.connections.insert(
                    connection,
                    Connection {
                        outbound,
                        state: SubscriptionState::default(),
                    },
                );
            }
            RouterCommand::Unregister { connection } => {
                if self.connections.remove(&connection).is_some() {
                    tracing::debug!(connection, "Connection unregistered");
                }
            }
            RouterCommand::Subscribe {
                connection,
                params,
                reply,
            } => {
                let backfill = self.subscribe(connection, params);
                let _ = reply.send(backfill);
            }
            RouterCommand::Unsubscribe {
                connection,
                params,
                reply,
            } => {
                let ack = self.unsubscribe(connection, params);
                let _ = reply.send(ack);
            }
        }
    }

    /// Update the subscription and collect the requested replay lines
    fn subscribe(&mut self, connection: ConnectionId, params: SubscribeParams) -> Backfill {
        let targets = params.targets();
        let replay = params.replay.unwrap_or(0);

        let Some(conn) = self.connections.get_mut(&connection) else {
            tracing::warn!(connection, "Subscribe from unregistered connection");
            return Backfill {
                ack: SubscriptionState::default().ack(0),
                lines: Vec::new(),
                outbound: None,
            };
        };

        conn.state.session_ids.extend(targets.iter().cloned());
        conn.state.subscribe_all |= params.all;
        conn.state.replay_lines = replay;
        tracing::debug!(connection, sessions = ?targets, all = params.all, replay, "Subscribed");

        let mut lines = Vec::new();
        if replay > 0 {
            let replay_targets = if params.all {
                self.manager.live_session_ids()
            } else {
                targets
            };

            for session_id in replay_targets {
                let output = match self.manager.get_output(&session_id, Some(replay)) {
                    Ok(output) => output,
                    Err(e) => {
                        tracing::debug!(connection, "Nothing to replay for {}: {}", session_id, e);
                        continue;
                    }
                };

                for line in output.lines {
                    let event = SessionEvent::Output {
                        session_id: session_id.clone(),
                        payload: OutputPayload {
                            chunk: format!("{}\r\n", line),
                            lines: vec![line],
                            timestamp: current_time_millis(),
                        },
                    };
                    if let Some(encoded) = encode(&event) {
                        lines.push(encoded);
                    }
                }
            }
        }

        Backfill {
            ack: conn.state.ack(0),
            lines,
            outbound: Some(conn.outbound.clone()),
        }
    }

    fn unsubscribe(&mut self, connection: ConnectionId, params: UnsubscribeParams) -> SubscribeAck {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return SubscriptionState::default().ack(0);
        };

        for id in params.targets() {
            conn.state.session_ids.remove(&id);
        }
        if params.all {
            conn.state.subscribe_all = false;
        }
        tracing::debug!(connection, sessions = ?params.targets(), all = params.all, "Unsubscribed");

        conn.state.ack(0)
    }

    fn fan_out(&self, event: &SessionEvent) {
        let session_id = event.session_id();
        let interested: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.state.should_receive(session_id))
            .collect();
        if interested.is_empty() {
            return;
        }
        let Some(line) = encode(event) else {
            return;
        };

        for (connection, conn) in interested {
            match conn.outbound.try_send(line.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection = *connection,
                        event = event.name(),
                        "Outbound queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::trace!(connection = *connection, "Outbound queue closed");
                }
            }
        }
    }
}

fn encode(event: &SessionEvent) -> Option<String> {
    let line = event
        .to_envelope()
        .and_then(|envelope| ServerMessage::Event(envelope).to_line());
    match line {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::warn!(event = event.name(), "Failed to encode event: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use sm_core::config::SessionConfig;
    use sm_core::events::ExitPayload;

    use crate::session::testing::FakeBackend;
    use crate::session::SessionOptions;

    fn router() -> (RouterHandle, mpsc::UnboundedSender<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(SessionConfig::default(), events_tx.clone());
        let (handle, _task) = spawn_router(manager, events_rx);
        (handle, events_tx)
    }

    fn exit_event(session_id: &str) -> SessionEvent {
        SessionEvent::Exit {
            session_id: session_id.to_string(),
            payload: ExitPayload {
                exit_code: Some(0),
                timestamp: 1,
            },
        }
    }

    async fn next_line(rx: &mut mpsc::Receiver<String>) -> Option<String> {
        tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_should_receive() {
        let mut state = SubscriptionState::default();
        assert!(state.should_receive(None));
        assert!(!state.should_receive(Some("s1")));

        state.session_ids.insert("s1".to_string());
        assert!(state.should_receive(Some("s1")));
        assert!(!state.should_receive(Some("s2")));

        state.subscribe_all = true;
        assert!(state.should_receive(Some("s2")));
    }

    #[tokio::test]
    async fn test_events_follow_subscriptions() {
        let (handle, events) = router();
        let (tx, mut rx) = mpsc::channel(16);
        handle.register(1, tx);

        let ack = handle
            .subscribe(
                1,
                SubscribeParams {
                    session_id: Some("s1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ack.sessions, vec!["s1"]);

        events.send(exit_event("s2")).unwrap();
        events.send(exit_event("s1")).unwrap();
        let line = next_line(&mut rx).await.unwrap();
        assert!(line.contains("\"sessionId\":\"s1\""));

        handle
            .unsubscribe(
                1,
                UnsubscribeParams {
                    session_id: Some("s1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        events.send(exit_event("s1")).unwrap();
        assert!(next_line(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (handle, _events) = router();
        let (tx, _rx) = mpsc::channel(16);
        handle.register(7, tx);

        for _ in 0..2 {
            let ack = handle
                .unsubscribe(
                    7,
                    UnsubscribeParams {
                        sessions: vec!["ghost".to_string()],
                        all: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert!(ack.sessions.is_empty());
            assert!(!ack.all);
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_for_slow_connection() {
        let (handle, events) = router();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(16);
        handle.register(1, slow_tx);
        handle.register(2, fast_tx);

        let all = SubscribeParams {
            all: true,
            ..Default::default()
        };
        handle.subscribe(1, all.clone()).await.unwrap();
        handle.subscribe(2, all).await.unwrap();

        for _ in 0..3 {
            events.send(exit_event("s1")).unwrap();
        }

        for _ in 0..3 {
            assert!(next_line(&mut fast_rx).await.is_some());
        }
        assert!(next_line(&mut slow_rx).await.is_some());
        assert!(next_line(&mut slow_rx).await.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_connection_gets_nothing() {
        let (handle, events) = router();
        let (tx, mut rx) = mpsc::channel(16);
        handle.register(3, tx);
        handle.unregister(3);

        events.send(exit_event("s1")).unwrap();
        // Sender was dropped with the connection state
        assert!(next_line(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_blocked_replay_does_not_stall_other_connections() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            startup_settle: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let manager =
            SessionManager::with_backend(config, Arc::new(FakeBackend::new(false)), events_tx.clone());
        let (handle, _task) = spawn_router(manager.clone(), events_rx);

        manager
            .create_session(
                "s1",
                SessionOptions {
                    cwd: Some(std::env::temp_dir()),
                    ..SessionOptions::default()
                },
            )
            .await
            .unwrap();
        for i in 0..4 {
            manager.send_input("s1", &format!("line {}", i), true).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.get_output("s1", None).unwrap().lines.len() >= 3);

        // Room for one replay line and nobody reading
        let (stuck_tx, _stuck_rx) = mpsc::channel(1);
        handle.register(1, stuck_tx);
        let stuck = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .subscribe(
                        1,
                        SubscribeParams {
                            session_id: Some("s1".to_string()),
                            replay: Some(10),
                            ..Default::default()
                        },
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stuck.is_finished());

        let (live_tx, mut live_rx) = mpsc::channel(16);
        handle.register(2, live_tx);
        let ack = tokio::time::timeout(
            Duration::from_millis(200),
            handle.subscribe(
                2,
                SubscribeParams {
                    all: true,
                    ..Default::default()
                },
            ),
        )
        .await
        .expect("router stalled by blocked replay")
        .unwrap();
        assert!(ack.all);

        events_tx.send(exit_event("other")).unwrap();
        let mut delivered = false;
        while let Some(line) = next_line(&mut live_rx).await {
            if line.contains("\"sessionId\":\"other\"") {
                delivered = true;
                break;
            }
        }
        assert!(delivered);
        assert!(!stuck.is_finished());
        stuck.abort();
    }
}
