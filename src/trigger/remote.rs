//! Remote command channel
//!
//! Polls an ntfy-style HTTP topic for short text commands and publishes the
//! acknowledgements to a reply topic. Delivery is at-least-once: the same
//! message can show up again, which the dispatcher coalesces.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CommandReply, CommandSource, InboundCommand};
use crate::clock::unix_now;
use crate::config::RemoteConfig;
use crate::recording::StopReason;
use crate::sync::EngineEvent;

const MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);

/// One line of the topic's JSON stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl RemoteMessage {
    /// Command text, if this is a message event carrying one
    pub fn command_text(&self) -> Option<&str> {
        if self.event != "message" {
            return None;
        }
        self.message
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// Parse a newline-delimited JSON poll response, skipping bad lines
pub fn parse_messages(body: &str) -> Vec<RemoteMessage> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<RemoteMessage>(line) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping unparseable remote message: {}", e);
                None
            }
        })
        .collect()
}

fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    let exp = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.checked_mul(exp)
        .unwrap_or(MAX_POLL_BACKOFF)
        .min(MAX_POLL_BACKOFF)
}

pub struct RemoteChannel {
    client: Client,
    endpoint: String,
    topic: String,
    reply_topic: Option<String>,
    poll_interval: Duration,
    /// Message id (or unix time at startup) to resume polling from
    since: String,
}

impl RemoteChannel {
    pub fn new(endpoint: &str, config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            topic: config.topic.clone(),
            reply_topic: config.reply_topic.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            since: (unix_now() as u64).to_string(),
        })
    }

    fn poll_url(&self) -> String {
        format!(
            "{}/{}/json?poll=1&since={}",
            self.endpoint, self.topic, self.since
        )
    }

    /// Fetch commands published since the last poll
    pub async fn poll(&mut self) -> Result<Vec<RemoteMessage>> {
        let body = self
            .client
            .get(self.poll_url())
            .send()
            .await
            .context("Failed to poll remote command topic")?
            .error_for_status()
            .context("Remote command topic returned error status")?
            .text()
            .await
            .context("Failed to read remote command response")?;

        let messages = parse_messages(&body);
        if let Some(last) = messages.last() {
            self.since = last.id.clone();
        }
        Ok(messages)
    }

    /// Publish a text acknowledgement to the reply topic, if one is configured
    pub async fn reply(&self, text: &str) -> Result<()> {
        let Some(topic) = self.reply_topic.as_ref() else {
            return Ok(());
        };
        self.client
            .post(format!("{}/{}", self.endpoint, topic))
            .body(text.to_string())
            .send()
            .await
            .context("Failed to publish remote reply")?
            .error_for_status()
            .context("Remote reply returned error status")?;
        Ok(())
    }

    async fn reply_logged(&self, text: &str) {
        if let Err(e) = self.reply(text).await {
            warn!("{:#}", e);
        }
    }

    /// Hand one poll's commands to the dispatcher as a single burst and
    /// acknowledge each of them once handled
    async fn forward(&self, messages: Vec<RemoteMessage>, commands: &mpsc::Sender<InboundCommand>) {
        let received_at = unix_now();
        let mut pending: Vec<(String, oneshot::Receiver<CommandReply>)> = Vec::new();

        for message in &messages {
            let Some(text) = message.command_text() else {
                continue;
            };
            info!("Remote command '{}' (id {})", text, message.id);
            let (tx, rx) = oneshot::channel();
            let inbound =
                InboundCommand::new(CommandSource::Remote, text, received_at).with_reply(tx);
            if commands.send(inbound).await.is_err() {
                debug!("Dispatcher gone, dropping remote command");
                return;
            }
            pending.push((text.to_string(), rx));
        }

        for (text, rx) in pending {
            match rx.await {
                Ok(reply) => self.reply_logged(&format!("{}: {}", text, reply)).await,
                Err(_) => debug!("No reply for remote command '{}'", text),
            }
        }
    }

    async fn announce(&self, event: EngineEvent) {
        let text = match event {
            // Requested stops were already acknowledged as command replies
            EngineEvent::RecordingFinished { summary }
                if summary.stop_reason != StopReason::Requested =>
            {
                summary.describe()
            }
            EngineEvent::RecordingFailed { error } => format!("recording failed: {}", error),
            _ => return,
        };
        self.reply_logged(&text).await;
    }

    pub async fn run(
        mut self,
        commands: mpsc::Sender<InboundCommand>,
        mut events: broadcast::Receiver<EngineEvent>,
        shutdown: CancellationToken,
    ) {
        info!(
            "Remote command channel polling {}/{} every {:?}",
            self.endpoint, self.topic, self.poll_interval
        );
        let mut failures: u32 = 0;
        // Engine events must not push the next poll back
        let next_poll = tokio::time::sleep_until(Instant::now());
        tokio::pin!(next_poll);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = events.recv() => match event {
                    Ok(event) => self.announce(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Remote channel missed {} engine events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = &mut next_poll => {
                    let delay = match self.poll().await {
                        Ok(messages) => {
                            if failures > 0 {
                                info!("Remote command channel recovered after {} failures", failures);
                            }
                            failures = 0;
                            if !messages.is_empty() {
                                self.forward(messages, &commands).await;
                            }
                            self.poll_interval
                        }
                        Err(e) => {
                            failures += 1;
                            let delay = backoff_for_attempt(self.poll_interval, failures);
                            warn!("{:#} (retry in {:?})", e, delay);
                            delay
                        }
                    };
                    next_poll.as_mut().reset(Instant::now() + delay);
                }
            }
        }

        info!("Remote command channel stopped");
    }
}
