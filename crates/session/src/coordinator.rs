//! Orchestrates chat turns across the two transports.
//!
//! Single writer for the chat log and system status: the streaming
//! exchange, the push channel's events, and user submissions all funnel
//! through here. Every submitted turn resolves with exactly one assistant
//! or system message.

use shared::events::{ChannelEvent, TurnState};
use shared::types::MessageDraft;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};
use transport::channel::CommandChannel;
use transport::chat::StreamingTransport;

use crate::log::ChatLog;
use crate::status::SystemStatus;

pub struct ProtocolCoordinator {
    log: Arc<ChatLog>,
    status: Arc<SystemStatus>,
    exchange: Arc<dyn StreamingTransport>,
    channel: Arc<dyn CommandChannel>,
    history_window: usize,
    turn_seq: AtomicU64,
    /// Turn currently awaiting a reply; 0 when idle. A resolution carrying
    /// a stale turn id is a no-op, so an abandoned streaming read can never
    /// double-resolve a turn the fallback already settled.
    pending_turn: AtomicU64,
}

impl ProtocolCoordinator {
    pub fn new(
        log: Arc<ChatLog>,
        status: Arc<SystemStatus>,
        exchange: Arc<dyn StreamingTransport>,
        channel: Arc<dyn CommandChannel>,
        history_window: usize,
    ) -> Self {
        Self {
            log,
            status,
            exchange,
            channel,
            history_window,
            turn_seq: AtomicU64::new(0),
            pending_turn: AtomicU64::new(0),
        }
    }

    /// Submit one user turn. The user message is appended immediately; the
    /// streaming exchange is tried first and the push channel's
    /// command/response pair is the degraded path.
    pub async fn submit(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        self.log.append(MessageDraft::user(text));
        self.log.set_generating(true);
        let turn = self.turn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending_turn.store(turn, Ordering::SeqCst);

        let history = self.log.history_window(self.history_window);
        match self.exchange.send(text, &history).await {
            Ok(reply) => {
                if !self.try_resolve(turn) {
                    debug!("discarding stale streaming result for turn {}", turn);
                    return;
                }
                self.log.append(
                    MessageDraft::assistant(reply.reply)
                        .with_origin(reply.origin)
                        .with_actions(reply.actions),
                );
                self.log.set_generating(false);
            }
            Err(e) => {
                if self.pending_turn.load(Ordering::SeqCst) != turn {
                    debug!("ignoring stale streaming failure for turn {}", turn);
                    return;
                }
                warn!("streaming exchange failed, degrading to push channel: {}", e);
                if self.channel.is_connected().await {
                    match self.channel.send_command(text).await {
                        // Resolution arrives via the channel's response event.
                        Ok(()) => {}
                        Err(send_err) => self.fail_turn(turn, &send_err.to_string()),
                    }
                } else {
                    self.fail_turn(turn, &e.to_string());
                }
            }
        }
    }

    /// Pump channel events into the state containers. Spawn once per
    /// channel; exits when the channel's sender side is dropped.
    pub async fn run_events(&self, mut events: UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Opened => self.status.set_connected(true),
                ChannelEvent::Closed => {
                    self.status.set_connected(false);
                    self.log.set_generating(false);
                }
                ChannelEvent::OpenFailed(reason) => {
                    debug!("channel open failed: {}", reason);
                    self.status.set_connected(false);
                    self.log.set_generating(false);
                }
                ChannelEvent::Telemetry(stats) => self.status.replace_stats(stats),
                ChannelEvent::TurnCompleted {
                    text,
                    intent,
                    origin,
                } => {
                    // Generation ends on every response, even a textless one;
                    // only a real reply settles the pending turn.
                    if let Some(text) = text {
                        let pending = self.pending_turn.swap(0, Ordering::SeqCst);
                        if pending != 0 {
                            debug!("turn {} resolved via push channel", pending);
                        }
                        self.log.append(
                            MessageDraft::assistant(text)
                                .with_intent(intent)
                                .with_origin(origin),
                        );
                    }
                    self.log.set_generating(false);
                }
                ChannelEvent::TurnState(TurnState::Processing) => {
                    self.log.set_generating(true);
                }
                ChannelEvent::TurnState(TurnState::Other) => {}
            }
        }
    }

    fn fail_turn(&self, turn: u64, detail: &str) {
        if !self.try_resolve(turn) {
            return;
        }
        self.log
            .append(MessageDraft::system(format!("Request failed: {}", detail)));
        self.log.set_generating(false);
    }

    /// Marks the turn resolved; false when another path got there first.
    fn try_resolve(&self, turn: u64) -> bool {
        self.pending_turn
            .compare_exchange(turn, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use shared::types::{
        ActionRecord, CpuStats, DiskStats, HistoryEntry, MemoryStats, Role, SystemStats,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;
    use transport::channel::ChannelError;
    use transport::chat::{ExchangeError, TurnReply};

    struct StubExchange {
        result: Mutex<Option<Result<TurnReply, ExchangeError>>>,
        seen_history: Mutex<Vec<HistoryEntry>>,
    }

    impl StubExchange {
        fn ok(reply: TurnReply) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(Ok(reply))),
                seen_history: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(Err(ExchangeError::NoReply))),
                seen_history: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamingTransport for StubExchange {
        async fn send(
            &self,
            _message: &str,
            history: &[HistoryEntry],
        ) -> Result<TurnReply, ExchangeError> {
            *self.seen_history.lock() = history.to_vec();
            self.result.lock().take().unwrap_or(Err(ExchangeError::NoReply))
        }
    }

    struct StubChannel {
        connected: bool,
        sent: Mutex<Vec<String>>,
    }

    impl StubChannel {
        fn connected() -> Arc<Self> {
            Arc::new(Self {
                connected: true,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn offline() -> Arc<Self> {
            Arc::new(Self {
                connected: false,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandChannel for StubChannel {
        async fn is_connected(&self) -> bool {
            self.connected
        }

        async fn send_command(&self, text: &str) -> Result<(), ChannelError> {
            if !self.connected {
                return Err(ChannelError::NotConnected);
            }
            self.sent.lock().push(text.to_string());
            Ok(())
        }
    }

    fn coordinator(
        exchange: Arc<dyn StreamingTransport>,
        channel: Arc<dyn CommandChannel>,
    ) -> (Arc<ProtocolCoordinator>, Arc<ChatLog>, Arc<SystemStatus>) {
        let log = Arc::new(ChatLog::new());
        let status = Arc::new(SystemStatus::new());
        let coordinator = Arc::new(ProtocolCoordinator::new(
            Arc::clone(&log),
            Arc::clone(&status),
            exchange,
            channel,
            20,
        ));
        (coordinator, log, status)
    }

    fn sample_stats() -> SystemStats {
        SystemStats {
            cpu: CpuStats {
                percent: 5.0,
                cores: 4,
            },
            memory: MemoryStats {
                used_gb: 2.0,
                total_gb: 8.0,
                percent: 25.0,
            },
            disk: DiskStats {
                used_gb: 10.0,
                total_gb: 100.0,
                percent: 10.0,
            },
            battery: None,
        }
    }

    #[tokio::test]
    async fn test_streaming_success_appends_exactly_one_assistant_message() {
        let exchange = StubExchange::ok(TurnReply {
            reply: "4".into(),
            origin: Some("local".into()),
            actions: vec![ActionRecord {
                tool: "calc".into(),
                description: None,
                success: true,
            }],
        });
        let (coordinator, log, _status) =
            coordinator(exchange.clone(), StubChannel::offline());

        coordinator.submit("What is 2+2?").await;

        let messages = log.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "What is 2+2?");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "4");
        assert_eq!(messages[1].actions.len(), 1);
        assert_eq!(messages[1].actions[0].tool, "calc");
        assert!(!log.is_generating());

        // history sent to the backend includes the freshly appended user turn
        let history = exchange.seen_history.lock();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "What is 2+2?");
    }

    #[tokio::test]
    async fn test_fallback_resolves_via_channel_response() {
        let channel = StubChannel::connected();
        let (coordinator, log, _status) =
            coordinator(StubExchange::failing(), channel.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pump = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_events(events_rx).await })
        };

        coordinator.submit("open the pod bay doors").await;
        assert_eq!(channel.sent.lock().as_slice(), ["open the pod bay doors"]);
        assert!(log.is_generating());

        events_tx
            .send(ChannelEvent::TurnCompleted {
                text: Some("I'm afraid I can't do that".into()),
                intent: Some("refuse".into()),
                origin: None,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = log.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].intent.as_deref(), Some("refuse"));
        assert!(!log.is_generating());

        drop(events_tx);
        pump.await.unwrap();
    }

    /// Exchange that parks until released, then succeeds. Lets a test
    /// deliver a channel reply while the streaming read is still in flight.
    struct ParkedExchange {
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl StreamingTransport for ParkedExchange {
        async fn send(
            &self,
            _message: &str,
            _history: &[HistoryEntry],
        ) -> Result<TurnReply, ExchangeError> {
            self.gate.notified().await;
            Ok(TurnReply {
                reply: "late streaming reply".into(),
                origin: None,
                actions: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_late_streaming_result_after_channel_reply_is_discarded() {
        let exchange = Arc::new(ParkedExchange {
            gate: tokio::sync::Notify::new(),
        });
        let (coordinator, log, _status) =
            coordinator(exchange.clone(), StubChannel::connected());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pump = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_events(events_rx).await })
        };

        let submitting = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.submit("what now?").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The channel answers the turn while the streaming read is parked.
        events_tx
            .send(ChannelEvent::TurnCompleted {
                text: Some("channel reply".into()),
                intent: None,
                origin: None,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.len(), 2);

        // The abandoned streaming read resolves afterwards; it must change
        // nothing.
        exchange.gate.notify_one();
        submitting.await.unwrap();

        let messages = log.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "channel reply");
        assert!(!log.is_generating());

        drop(events_tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_textless_channel_response_clears_generating_without_appending() {
        let (coordinator, log, _status) =
            coordinator(StubExchange::failing(), StubChannel::offline());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pump = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_events(events_rx).await })
        };

        events_tx
            .send(ChannelEvent::TurnState(TurnState::Processing))
            .unwrap();
        events_tx
            .send(ChannelEvent::TurnCompleted {
                text: None,
                intent: Some("noop".into()),
                origin: None,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(log.is_empty());
        assert!(!log.is_generating());

        drop(events_tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_total_failure_appends_system_message() {
        let (coordinator, log, _status) =
            coordinator(StubExchange::failing(), StubChannel::offline());

        coordinator.submit("hello?").await;

        let messages = log.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::System);
        assert!(messages[1].content.contains("Request failed"));
        assert!(!log.is_generating());
    }

    #[tokio::test]
    async fn test_channel_close_clears_generating_and_connectivity() {
        let (coordinator, log, status) =
            coordinator(StubExchange::failing(), StubChannel::offline());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pump = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_events(events_rx).await })
        };

        events_tx.send(ChannelEvent::Opened).unwrap();
        events_tx
            .send(ChannelEvent::TurnState(TurnState::Processing))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(status.connected());
        assert!(log.is_generating());

        events_tx.send(ChannelEvent::Closed).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!status.connected());
        assert!(!log.is_generating());

        drop(events_tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_telemetry_replaces_snapshot() {
        let (coordinator, _log, status) =
            coordinator(StubExchange::failing(), StubChannel::offline());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pump = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_events(events_rx).await })
        };

        events_tx
            .send(ChannelEvent::Telemetry(sample_stats()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(status.stats().unwrap().cpu.cores, 4);

        drop(events_tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_submission_is_ignored() {
        let (coordinator, log, _status) =
            coordinator(StubExchange::failing(), StubChannel::offline());
        coordinator.submit("   ").await;
        assert!(log.is_empty());
        assert!(!log.is_generating());
    }
}
