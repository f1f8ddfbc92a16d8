//! Scripted in-memory transport for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportEvent};
use crate::{IndiError, IndiResult, NewPropertyItem};

type Responder = Arc<dyn Fn(&NewPropertyItem) -> Vec<(Duration, TransportEvent)> + Send + Sync>;

/// Records every request and replays scripted events.
///
/// A responder maps a request to events delivered after the given delays,
/// which is how tests simulate Busy -> Ok or Busy -> Alert transitions.
#[derive(Default)]
pub struct MockTransport {
    connected: AtomicBool,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    sent: Mutex<Vec<NewPropertyItem>>,
    responder: Mutex<Option<Responder>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&NewPropertyItem) -> Vec<(Duration, TransportEvent)> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    /// Make every subsequent send fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Requests sent so far
    pub fn sent(&self) -> Vec<NewPropertyItem> {
        self.sent.lock().clone()
    }

    /// Requests for one property
    pub fn sent_for(&self, property: &str) -> Vec<NewPropertyItem> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.property == property)
            .cloned()
            .collect()
    }

    /// Deliver an event as if the server sent it
    pub async fn push(&self, event: TransportEvent) {
        let sender = self.events.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Wait until the consumer has drained every pushed event
    pub async fn settle(&self) {
        let sender = self.events.lock().clone();
        if let Some(sender) = sender {
            for _ in 0..200 {
                if sender.capacity() == sender.max_capacity() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
        events: mpsc::Sender<TransportEvent>,
    ) -> IndiResult<()> {
        *self.events.lock() = Some(events);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> IndiResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        *self.events.lock() = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_new_property(&self, request: &NewPropertyItem) -> IndiResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(IndiError::ChannelClosed("mock send failure".into()));
        }
        self.sent.lock().push(request.clone());

        let responder = self.responder.lock().clone();
        let sender = self.events.lock().clone();
        if let (Some(responder), Some(sender)) = (responder, sender) {
            for (delay, event) in responder(request) {
                let sender = sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(event).await;
                });
            }
        }
        Ok(())
    }

    async fn connect_device(&self, device: &str) -> IndiResult<()> {
        self.send_new_property(&NewPropertyItem::switch_on(
            device,
            crate::protocol::standard_properties::CONNECTION,
            crate::protocol::standard_properties::CONNECT,
        ))
        .await
    }

    async fn disconnect_device(&self, device: &str) -> IndiResult<()> {
        self.send_new_property(&NewPropertyItem::switch_on(
            device,
            crate::protocol::standard_properties::CONNECTION,
            crate::protocol::standard_properties::DISCONNECT,
        ))
        .await
    }
}
