//! In-process connector for tests and offline runs.
//!
//! A [`MemoryConnector`] hands out sockets according to a plan of outcomes queued with
//! [`MemoryConnector::refuse`] and [`MemoryConnector::accept`]. When the plan is empty
//! every attempt is refused. The returned [`MemoryPeer`] plays the backend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use super::socket::{Connector, Socket};
use crate::error::{ViewerError, ViewerResult};
use crate::protocol::{InboundMessage, OutboundCommand};

enum Outcome {
    Refuse(String),
    Accept(MemorySocket),
}

#[derive(Default)]
struct Plan {
    outcomes: VecDeque<Outcome>,
    attempts: u32,
}

/// Connector that plays back planned outcomes.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    plan: Arc<Mutex<Plan>>,
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector")
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl MemoryConnector {
    /// Creates a connector that refuses every attempt until told otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a refused attempt.
    pub fn refuse(&self, reason: impl Into<String>) {
        self.lock().outcomes.push_back(Outcome::Refuse(reason.into()));
    }

    /// Queues a successful attempt and returns the backend side of its socket.
    #[must_use]
    pub fn accept(&self) -> MemoryPeer {
        let (to_client, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_client) = mpsc::unbounded_channel();
        self.lock().outcomes.push_back(Outcome::Accept(MemorySocket {
            incoming: from_peer,
            outgoing: Some(to_peer),
        }));
        MemoryPeer {
            outgoing: Some(to_client),
            incoming: from_client,
        }
    }

    /// Number of attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Plan> {
        self.plan.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, endpoint: &Url) -> ViewerResult<Box<dyn Socket>> {
        let outcome = {
            let mut plan = self.lock();
            plan.attempts += 1;
            plan.outcomes.pop_front()
        };
        match outcome {
            Some(Outcome::Accept(socket)) => Ok(Box::new(socket)),
            Some(Outcome::Refuse(reason)) => Err(ViewerError::TransientNetworkFailure(reason)),
            None => Err(ViewerError::TransientNetworkFailure(format!(
                "connection refused: {endpoint}"
            ))),
        }
    }
}

struct MemorySocket {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send_text(&mut self, text: String) -> ViewerResult<()> {
        let sender = self.outgoing.as_ref().ok_or(ViewerError::NotConnected)?;
        sender
            .send(text)
            .map_err(|_| ViewerError::TransientNetworkFailure("peer hung up".into()))
    }

    async fn next_text(&mut self) -> Option<ViewerResult<String>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> ViewerResult<()> {
        self.outgoing = None;
        self.incoming.close();
        Ok(())
    }
}

/// Backend side of an in-process socket.
#[derive(Debug)]
pub struct MemoryPeer {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    incoming: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Sends a raw text frame to the client. Returns `false` if the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing
            .as_ref()
            .is_some_and(|tx| tx.send(text.into()).is_ok())
    }

    /// Encodes and sends an inbound message to the client.
    pub fn push(&self, message: &InboundMessage) -> ViewerResult<bool> {
        Ok(self.send_text(serde_json::to_string(message)?))
    }

    /// Waits for the next command from the client. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<ViewerResult<OutboundCommand>> {
        let text = self.incoming.recv().await?;
        Some(serde_json::from_str(&text).map_err(ViewerError::from))
    }

    /// Returns a command if one is already waiting.
    pub fn try_recv(&mut self) -> Option<ViewerResult<OutboundCommand>> {
        let text = self.incoming.try_recv().ok()?;
        Some(serde_json::from_str(&text).map_err(ViewerError::from))
    }

    /// Closes the socket from the backend side.
    pub fn close(&mut self) {
        self.outgoing = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plan_is_played_in_order() {
        let connector = MemoryConnector::new();
        let url = Url::parse("ws://backend/ws").unwrap();
        connector.refuse("busy pod");
        let mut peer = connector.accept();

        let first = connector.open(&url).await;
        assert!(matches!(first, Err(ViewerError::TransientNetworkFailure(r)) if r == "busy pod"));

        let mut socket = connector.open(&url).await.unwrap();
        socket.send_text(r#"{"cmd":"get_ui_data"}"#.into()).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().unwrap(), OutboundCommand::GetUiData);

        assert!(peer.send_text(r#"{"cmd":"status","data":"ok"}"#));
        assert_eq!(socket.next_text().await.unwrap().unwrap(), r#"{"cmd":"status","data":"ok"}"#);

        peer.close();
        assert!(socket.next_text().await.is_none());

        assert!(connector.open(&url).await.is_err());
        assert_eq!(connector.attempts(), 3);
    }
}
