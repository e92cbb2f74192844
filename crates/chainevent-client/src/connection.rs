//! Live event-stream connections and the provider that opens them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use chainevent_core::{Endpoint, EventError, MessageStream};
use chainevent_dispatcher::Event;

/// One open event stream to a single endpoint.
pub trait Connection: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Start forwarding inbound messages to `events` until the stream ends
    /// or the connection is closed. An unsolicited end of stream is reported
    /// as [`Event::Disconnected`].
    fn receive(&self, events: mpsc::Sender<Event>);

    /// Release the stream. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens connections; hides the transport implementation.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Dial `endpoint` and open its event stream for `channel_id`.
    async fn open(
        &self,
        channel_id: &str,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn Connection>, EventError>;
}

/// A [`Connection`] over an already-open [`MessageStream`].
pub struct StreamConnection {
    endpoint: Endpoint,
    stream: Mutex<Option<MessageStream>>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl StreamConnection {
    pub fn new(endpoint: Endpoint, stream: MessageStream) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            endpoint,
            stream: Mutex::new(Some(stream)),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }
}

impl Connection for StreamConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn receive(&self, events: mpsc::Sender<Event>) {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(stream) = stream else {
            warn!(url = %self.endpoint, "receive already started or connection closed");
            return;
        };
        tokio::spawn(receive_loop(
            stream,
            events,
            self.shutdown.subscribe(),
            Arc::clone(&self.closed),
            self.endpoint.url.clone(),
        ));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(url = %self.endpoint, "connection already closed");
            return;
        }
        debug!(url = %self.endpoint, "closing event connection");
        let _ = self.shutdown.send(true);
        // Not yet receiving: drop the stream here.
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn receive_loop(
    mut stream: MessageStream,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    url: String,
) {
    debug!(url = %url, "receive loop started");
    let error = loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!(url = %url, "receive loop stopped");
                return;
            }
            message = stream.next() => match message {
                Some(Ok(message)) => {
                    if events.send(Event::from_message(message, url.as_str())).await.is_err() {
                        debug!(url = %url, "dispatcher input queue closed, stopping receive loop");
                        return;
                    }
                }
                Some(Err(e)) => break e,
                None => break EventError::StreamEnded { url: url.clone() },
            },
        }
    };

    if closed.load(Ordering::Acquire) {
        return;
    }
    warn!(url = %url, error = %error, "event stream terminated");
    let _ = events.send(Event::Disconnected { error: Some(error) }).await;
}

#[cfg(test)]
mod tests {
    use chainevent_core::{FilteredBlock, TransportMessage};
    use chainevent_dispatcher::EventKind;
    use futures::channel::mpsc as feed;

    use super::*;

    fn block(number: u64) -> TransportMessage {
        TransportMessage::FilteredBlock(FilteredBlock {
            channel_id: "mychannel".into(),
            number,
            transactions: vec![],
        })
    }

    type Feed = feed::UnboundedSender<Result<TransportMessage, EventError>>;

    fn connection() -> (StreamConnection, Feed) {
        let (tx, rx) = feed::unbounded();
        let conn = StreamConnection::new(Endpoint::new("grpcs://peer0:7051"), Box::pin(rx));
        (conn, tx)
    }

    #[tokio::test]
    async fn forwards_messages_in_order() {
        let (conn, feed) = connection();
        let (events, mut rx) = mpsc::channel(10);
        conn.receive(events);

        feed.unbounded_send(Ok(block(1))).unwrap();
        feed.unbounded_send(Ok(block(2))).unwrap();

        for expected in [1, 2] {
            match rx.recv().await.unwrap() {
                Event::FilteredBlock { block, source_url } => {
                    assert_eq!(block.number, expected);
                    assert_eq!(source_url, "grpcs://peer0:7051");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn stream_error_reports_disconnect() {
        let (conn, feed) = connection();
        let (events, mut rx) = mpsc::channel(10);
        conn.receive(events);

        feed.unbounded_send(Err(EventError::Transport("reset by peer".into())))
            .unwrap();
        match rx.recv().await.unwrap() {
            Event::Disconnected { error } => {
                assert_eq!(error, Some(EventError::Transport("reset by peer".into())));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_of_stream_reports_disconnect() {
        let (conn, feed) = connection();
        let (events, mut rx) = mpsc::channel(10);
        conn.receive(events);
        drop(feed);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Disconnected);
    }

    #[tokio::test]
    async fn close_is_silent_and_idempotent() {
        let (conn, feed) = connection();
        let (events, mut rx) = mpsc::channel(10);
        conn.receive(events);

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        drop(feed);

        // The loop exits without reporting a disconnect; the sender it held
        // is dropped, so the queue ends.
        assert!(rx.recv().await.is_none());
    }
}
