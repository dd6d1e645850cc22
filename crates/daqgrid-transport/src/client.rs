//! Connection handle and the connector seam.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use daq_core::{AgentId, ExecutorId, OfferId, TaskId};

use crate::call::{Call, Event, LaunchInfo};
use crate::error::{TransportError, TransportResult};

/// Clonable handle for issuing calls.
///
/// Long-lived collaborators (command servant, environment manager) keep
/// one of these across reconnects; the controller rebinds it to each new
/// subscription. Calls issued while no subscription is live fail with
/// [`TransportError::Disconnected`].
#[derive(Clone)]
pub struct CallSender {
    tx: Arc<Mutex<mpsc::Sender<Call>>>,
}

impl CallSender {
    pub(crate) fn new(tx: mpsc::Sender<Call>) -> Self {
        Self { tx: Arc::new(Mutex::new(tx)) }
    }

    /// A sender bound to nothing; every call fails until `rebind`.
    pub fn detached() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self::new(tx)
    }

    /// Point this handle at a new subscription's call channel.
    pub fn rebind(&self, other: &CallSender) {
        let inner = other.tx.lock().expect("call sender lock poisoned").clone();
        *self.tx.lock().expect("call sender lock poisoned") = inner;
    }

    pub async fn call(&self, call: Call) -> TransportResult<()> {
        let tx = self.tx.lock().expect("call sender lock poisoned").clone();
        tx.send(call)
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    pub async fn accept(&self, offer_id: OfferId, launches: Vec<LaunchInfo>) -> TransportResult<()> {
        self.call(Call::Accept { offer_id, launches }).await
    }

    pub async fn decline(&self, offer_ids: Vec<OfferId>) -> TransportResult<()> {
        self.call(Call::Decline { offer_ids }).await
    }

    pub async fn revive(&self) -> TransportResult<()> {
        self.call(Call::Revive).await
    }

    pub async fn kill(&self, task_id: TaskId, agent_id: AgentId) -> TransportResult<()> {
        self.call(Call::Kill { task_id, agent_id }).await
    }

    pub async fn message(
        &self,
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    ) -> TransportResult<()> {
        self.call(Call::Message { agent_id, executor_id, data }).await
    }
}

/// One subscription to the outer manager: a call handle plus the event
/// stream. Dropped on disconnect; the controller asks its [`Connector`]
/// for a fresh one.
pub struct ManagerConnection {
    pub calls: CallSender,
    events: mpsc::Receiver<TransportResult<Event>>,
}

impl ManagerConnection {
    /// Receive the next event.
    ///
    /// UPDATE events are acknowledged here, before the caller sees them;
    /// handlers never need to ack manually.
    pub async fn recv(&mut self) -> TransportResult<Event> {
        match self.events.recv().await {
            None => Err(TransportError::Disconnected),
            Some(Err(e)) => Err(e),
            Some(Ok(event)) => {
                if let Event::Update { status } = &event {
                    let ack = Call::Acknowledge { task_id: status.task_id.clone() };
                    if self.calls.call(ack).await.is_err() {
                        debug!(task_id = %status.task_id, "ack after disconnect dropped");
                    }
                }
                Ok(event)
            }
        }
    }
}

/// The far side of an in-process connection pair.
///
/// Held by whatever plays the outer manager: the loopback simulator, or a
/// test driving the scheduler by hand.
pub struct RemoteEnd {
    pub calls: mpsc::Receiver<Call>,
    pub events: mpsc::Sender<TransportResult<Event>>,
}

/// Create an in-process connection pair.
pub fn pair(capacity: usize) -> (ManagerConnection, RemoteEnd) {
    let (call_tx, call_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    (
        ManagerConnection {
            calls: CallSender::new(call_tx),
            events: event_rx,
        },
        RemoteEnd {
            calls: call_rx,
            events: event_tx,
        },
    )
}

/// Yields a fresh connection per subscription attempt.
///
/// The controller calls `connect` once per registration cycle; transport
/// failures returned here are retried under the registration backoff.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> TransportResult<ManagerConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::{TaskLifecycle, TaskStatus};

    #[tokio::test]
    async fn recv_acks_updates_automatically() {
        let (mut conn, mut remote) = pair(8);

        let status = TaskStatus {
            task_id: "t-1".to_string(),
            lifecycle: TaskLifecycle::Running,
            message: String::new(),
        };
        remote
            .events
            .send(Ok(Event::Update { status: status.clone() }))
            .await
            .unwrap();

        let event = conn.recv().await.unwrap();
        assert!(matches!(event, Event::Update { .. }));

        let ack = remote.calls.recv().await.unwrap();
        assert_eq!(ack, Call::Acknowledge { task_id: "t-1".to_string() });
    }

    #[tokio::test]
    async fn closed_stream_is_clean_disconnect() {
        let (mut conn, remote) = pair(8);
        drop(remote);
        assert!(matches!(conn.recv().await, Err(TransportError::Disconnected)));
    }

    #[tokio::test]
    async fn detached_sender_fails_until_rebound() {
        let shared = CallSender::detached();
        assert!(shared.revive().await.is_err());

        let (conn, mut remote) = pair(8);
        shared.rebind(&conn.calls);
        shared.revive().await.unwrap();
        assert_eq!(remote.calls.recv().await.unwrap(), Call::Revive);
    }

    #[tokio::test]
    async fn transport_error_passes_through() {
        let (mut conn, remote) = pair(8);
        remote
            .events
            .send(Err(TransportError::Transport("socket reset".to_string())))
            .await
            .unwrap();
        match conn.recv().await {
            Err(TransportError::Transport(msg)) => assert_eq!(msg, "socket reset"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
