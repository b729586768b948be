//! Reconnecting event-stream receiver.
//!
//! [`Reconnect`] follows the same rules as the browser client in
//! `static/client.mjs`. [`run_listener`] drives it over HTTP so a terminal or
//! a test can follow a hub the way a page does.

use futures_util::StreamExt;
use reqwest::Url;
use reqwest_eventsource::{retry::Never, Error as SseError, Event as SseEvent, EventSource};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::AfrError;
use crate::msg::{Msg, MsgKind, Reaction};
use crate::remote::Loc;

/// Consecutive failed reconnects tolerated after a successful open.
pub const RETRY_BUDGET: u32 = 8;
pub const RETRY_DELAY: Duration = Duration::from_millis(1024);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Connect,
    ConnectAfter(Duration),
    GiveUp,
    Ignore,
    React(Reaction),
}

#[derive(Debug, Clone)]
pub struct Reconnect {
    key: Option<String>,
    budget: u32,
    delay: Duration,
    // None until the first successful open: retry forever.
    remaining: Option<u32>,
    state: ConnState,
}

impl Reconnect {
    pub fn new(key: Option<String>) -> Self {
        Reconnect {
            key,
            budget: RETRY_BUDGET,
            delay: RETRY_DELAY,
            remaining: None,
            state: ConnState::Disconnected,
        }
    }

    pub fn with_retry(mut self, budget: u32, delay: Duration) -> Self {
        self.budget = budget;
        self.delay = delay;
        self
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn remaining(&self) -> Option<u32> {
        self.remaining
    }

    /// Drops whatever connection there was and opens a new one.
    pub fn connect(&mut self) -> Step {
        self.state = ConnState::Connecting;
        Step::Connect
    }

    pub fn on_open(&mut self) {
        self.state = ConnState::Connected;
        self.remaining = Some(self.budget);
    }

    pub fn on_error(&mut self) -> Step {
        self.state = ConnState::Disconnected;
        match self.remaining {
            None => Step::ConnectAfter(self.delay),
            Some(0) => Step::GiveUp,
            Some(n) => {
                self.remaining = Some(n - 1);
                Step::ConnectAfter(self.delay)
            }
        }
    }

    /// Handles one event payload. Messages for another key and anything
    /// that isn't a message are ignored.
    pub fn on_message(&mut self, data: &str) -> Step {
        let Ok(msg) = serde_json::from_str::<Msg>(data) else {
            return Step::Ignore;
        };
        if msg.key != self.key {
            return Step::Ignore;
        }
        match msg.kind {
            MsgKind::Deinit => self.connect(),
            MsgKind::Change | MsgKind::Rename => {
                Step::React(Reaction::for_path(msg.path.as_deref()))
            }
        }
    }
}

/// Follows the hub at `loc` until shutdown or until the retry budget runs out.
/// Reactions go to `reactions` when given, and are always logged.
pub async fn run_listener(
    loc: Loc,
    key: Option<String>,
    reactions: Option<mpsc::Sender<Reaction>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AfrError> {
    run_with(Reconnect::new(key), loc, reactions, &mut shutdown).await
}

pub async fn run_with(
    mut state: Reconnect,
    loc: Loc,
    reactions: Option<mpsc::Sender<Reaction>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), AfrError> {
    let url = loc.endpoint("events")?;
    let client = reqwest::Client::new();
    let mut step = state.connect();

    loop {
        match step {
            Step::GiveUp => {
                warn!("Giving up on {} after repeated failures", url);
                return Ok(());
            }
            Step::ConnectAfter(delay) => {
                debug!("Reconnecting to {} in {:?}", url, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
                state.connect();
            }
            Step::Connect | Step::Ignore | Step::React(_) => {}
        }

        step = tokio::select! {
            next = listen_once(&client, &url, &mut state, reactions.as_ref()) => next,
            _ = shutdown.changed() => {
                info!("Listener shutting down");
                return Ok(());
            }
        };
    }
}

async fn listen_once(
    client: &reqwest::Client,
    url: &Url,
    state: &mut Reconnect,
    reactions: Option<&mpsc::Sender<Reaction>>,
) -> Step {
    let mut source = match EventSource::new(client.get(url.clone())) {
        Ok(source) => source,
        Err(err) => {
            warn!("Cannot open event stream {}: {}", url, err);
            return state.on_error();
        }
    };
    // Retries are paced by `Reconnect`, not by the event source.
    source.set_retry_policy(Box::new(Never));

    while let Some(event) = source.next().await {
        match event {
            Ok(SseEvent::Open) => {
                state.on_open();
                info!("Connected to {}", url);
            }
            Ok(SseEvent::Message(message)) => match state.on_message(&message.data) {
                Step::React(reaction) => {
                    info!(?reaction, "Change received");
                    if let Some(tx) = reactions {
                        if tx.send(reaction).await.is_err() {
                            debug!("Reaction receiver dropped");
                        }
                    }
                }
                Step::Connect => {
                    debug!("Hub is going away, reconnecting");
                    source.close();
                    return Step::Connect;
                }
                _ => {}
            },
            Err(SseError::InvalidStatusCode(status, _)) => {
                warn!("Unexpected status {} from {}", status, url);
                break;
            }
            Err(SseError::StreamEnded) => {
                debug!("Event stream from {} ended", url);
                break;
            }
            Err(err) => {
                debug!("Event stream from {} broke: {}", url, err);
                break;
            }
        }
    }

    source.close();
    state.on_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_forever_before_first_open() {
        let mut state = Reconnect::new(None);
        for _ in 0..100 {
            assert_eq!(state.on_error(), Step::ConnectAfter(RETRY_DELAY));
        }
        assert_eq!(state.remaining(), None);
    }

    #[test]
    fn gives_up_once_budget_is_spent() {
        let mut state = Reconnect::new(None);
        state.connect();
        state.on_open();
        assert_eq!(state.state(), ConnState::Connected);

        for _ in 0..RETRY_BUDGET {
            assert_eq!(state.on_error(), Step::ConnectAfter(RETRY_DELAY));
        }
        assert_eq!(state.remaining(), Some(0));
        assert_eq!(state.on_error(), Step::GiveUp);
        assert_eq!(state.on_error(), Step::GiveUp);
        assert_eq!(state.state(), ConnState::Disconnected);
    }

    #[test]
    fn open_restores_budget() {
        let mut state = Reconnect::new(None).with_retry(2, Duration::from_millis(5));
        state.on_open();
        state.on_error();
        state.on_error();
        state.on_open();
        assert_eq!(state.remaining(), Some(2));
        assert_eq!(state.on_error(), Step::ConnectAfter(Duration::from_millis(5)));
    }

    #[test]
    fn filters_by_key() {
        let mut state = Reconnect::new(Some("one".into()));
        assert_eq!(
            state.on_message(r#"{"type":"change","path":"a.css","key":"two"}"#),
            Step::Ignore
        );
        assert_eq!(state.on_message(r#"{"type":"change","path":"a.css"}"#), Step::Ignore);
        assert_eq!(
            state.on_message(r#"{"type":"change","path":"a.css","key":"one"}"#),
            Step::React(Reaction::Stylesheet("a.css".into()))
        );

        let mut keyless = Reconnect::new(None);
        assert_eq!(
            keyless.on_message(r#"{"type":"rename","path":"index.html"}"#),
            Step::React(Reaction::Reload)
        );
    }

    #[test]
    fn deinit_reconnects_immediately() {
        let mut state = Reconnect::new(None);
        state.on_open();
        assert_eq!(state.on_message(r#"{"type":"deinit"}"#), Step::Connect);
        assert_eq!(state.state(), ConnState::Connecting);
    }

    #[test]
    fn ignores_garbage() {
        let mut state = Reconnect::new(None);
        assert_eq!(state.on_message("not json"), Step::Ignore);
        assert_eq!(state.on_message(r#"{"type":"explode"}"#), Step::Ignore);
        assert_eq!(
            state.on_message(r#"{"type":"change","path":"x.js.map"}"#),
            Step::React(Reaction::Ignore)
        );
    }
}
