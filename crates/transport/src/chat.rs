//! One-shot streaming chat exchange against the backend's `/api/chat`.

use crate::decode::{LineDecoder, StreamEvent};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use shared::types::{ActionRecord, HistoryEntry};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("chat request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat request returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("stream ended without a usable reply")]
    NoReply,
}

/// Resolved result of one streaming turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub reply: String,
    pub origin: Option<String>,
    pub actions: Vec<ActionRecord>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    stream: bool,
    history: &'a [HistoryEntry],
}

/// Folds stream events into the turn's final reply.
///
/// `action` events accumulate in arrival order; a `complete` event records
/// the reply and, when it carries a non-empty action list, replaces the
/// accumulated one wholesale.
#[derive(Default)]
struct TurnAccumulator {
    pending_actions: Vec<ActionRecord>,
    complete: Option<TurnReply>,
}

impl TurnAccumulator {
    fn observe(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Action {
                tool,
                description,
                success,
            } => {
                self.pending_actions.push(ActionRecord {
                    tool,
                    description,
                    success,
                });
            }
            StreamEvent::Complete {
                reply,
                brain,
                actions,
            } => {
                let actions = if actions.is_empty() {
                    std::mem::take(&mut self.pending_actions)
                } else {
                    actions
                };
                self.complete = Some(TurnReply {
                    reply,
                    origin: brain,
                    actions,
                });
            }
        }
    }

    fn finish(self) -> Result<TurnReply, ExchangeError> {
        self.complete.ok_or(ExchangeError::NoReply)
    }
}

/// Seam for the coordinator: lets tests stand in for the HTTP exchange.
#[async_trait]
pub trait StreamingTransport: Send + Sync {
    async fn send(
        &self,
        message: &str,
        history: &[HistoryEntry],
    ) -> Result<TurnReply, ExchangeError>;
}

/// Chunked request client. One instance is shared across turns; each call
/// to [`ChatExchange::send`] is an independent request with no retry — the
/// coordinator decides whether to degrade to the push channel.
pub struct ChatExchange {
    http: Client,
    base: String,
}

impl ChatExchange {
    /// `timeout` bounds the whole request including the streamed read.
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()?;
        Ok(Self {
            http,
            base: base.into(),
        })
    }
}

#[async_trait]
impl StreamingTransport for ChatExchange {
    async fn send(
        &self,
        message: &str,
        history: &[HistoryEntry],
    ) -> Result<TurnReply, ExchangeError> {
        let url = format!("{}/api/chat", self.base);
        let req = ChatRequest {
            message,
            stream: true,
            history,
        };
        let resp = self.http.post(url).json(&req).send().await?;
        if !resp.status().is_success() {
            return Err(ExchangeError::Status(resp.status()));
        }

        let mut decoder = LineDecoder::new();
        let mut accumulator = TurnAccumulator::default();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    // A finished turn survives a ragged stream tail.
                    return match accumulator.complete.take() {
                        Some(reply) => Ok(reply),
                        None => Err(ExchangeError::Transport(e)),
                    };
                }
            };
            for event in decoder.feed(&bytes) {
                accumulator.observe(event);
            }
        }

        accumulator.finish()
    }
}
