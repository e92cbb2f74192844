//! Event dispatcher extended with connection lifecycle handling.
//!
//! [`ClientDispatcher`] wraps an [`EventDispatcher`] and runs it over a
//! [`Session`] state that additionally owns the single live [`Connection`]
//! and the single connection-event subscriber. Connect, disconnect and
//! connection notifications travel through the same input queue as
//! registrations and blocks.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chainevent_core::{
    BlockEvent, CcEvent, ConnectionEvent, DiscoveryService, EventError, EventServiceConfig,
    FilteredBlockEvent, LoadBalancePolicy, TxStatusEvent,
};
use chainevent_dispatcher::dispatcher::{handle_stop, handle_unregister};
use chainevent_dispatcher::{
    publish, BlockFilter, Dispatch, DispatcherCore, Event, EventDispatcher, EventKind,
    HandlerTable, Registration, RegistrationInfo,
};

use crate::connection::{Connection, ConnectionProvider};

/// Dispatcher-task state of a [`ClientDispatcher`].
struct Session {
    core: DispatcherCore,
    events: mpsc::Sender<Event>,
    channel_id: String,
    discovery: Arc<dyn DiscoveryService>,
    provider: Arc<dyn ConnectionProvider>,
    policy: Arc<dyn LoadBalancePolicy>,
    dial_timeout: Duration,
    connection: Option<Box<dyn Connection>>,
    connection_reg: Option<(u64, mpsc::Sender<ConnectionEvent>)>,
}

impl Dispatch for Session {
    fn core(&mut self) -> &mut DispatcherCore {
        &mut self.core
    }
}

impl Session {
    fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    async fn open_connection(&mut self) -> Result<(), EventError> {
        let peers = self.discovery.peers().await?;
        if peers.is_empty() {
            return Err(EventError::NoPeers {
                channel_id: self.channel_id.clone(),
            });
        }
        let endpoint = self.policy.choose(&peers)?.clone();
        info!(channel = %self.channel_id, url = %endpoint, "opening event connection");

        let open = self.provider.open(&self.channel_id, &endpoint);
        let connection = tokio::time::timeout(self.dial_timeout, open)
            .await
            .map_err(|_| EventError::Timeout {
                operation: format!("open connection to {endpoint}"),
                ms: self.dial_timeout.as_millis() as u64,
            })??;
        connection.receive(self.events.clone());
        self.connection = Some(connection);
        Ok(())
    }

    fn close_connection(&mut self) -> bool {
        match self.connection.take() {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    async fn notify(&self, event: ConnectionEvent) {
        match &self.connection_reg {
            Some((_, sender)) => {
                publish(sender, event, self.core.backpressure(), "connection").await;
            }
            None if event.connected => debug!("connected, no connection subscriber"),
            None => warn!(error = ?event.error, "disconnected, no connection subscriber"),
        }
    }
}

fn handle_connect(session: &mut Session, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::Connect { respond } = event else {
            return;
        };
        if session.is_connected() {
            debug!("already connected");
            let _ = respond.send(Ok(()));
            return;
        }

        let result = session.open_connection().await;
        if let Err(e) = &result {
            warn!(channel = %session.channel_id, error = %e, "connect failed");
        }
        let _ = respond.send(result);
    }
    .boxed()
}

fn handle_disconnect(session: &mut Session, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::Disconnect { respond } = event else {
            return;
        };
        let result = if session.close_connection() {
            info!(channel = %session.channel_id, "event connection closed");
            Ok(())
        } else {
            Err(EventError::ConnectionClosed)
        };
        let _ = respond.send(result);
    }
    .boxed()
}

fn handle_connected(session: &mut Session, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::Connected = event else {
            return;
        };
        session.notify(ConnectionEvent::connected()).await;
    }
    .boxed()
}

fn handle_disconnected(session: &mut Session, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::Disconnected { error } = event else {
            return;
        };
        debug!(error = ?error, "disconnected from event service");
        session.close_connection();
        session.notify(ConnectionEvent::disconnected(error)).await;
    }
    .boxed()
}

fn handle_register_connection(session: &mut Session, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::RegisterConnection { sender, respond } = event else {
            return;
        };
        if session.connection_reg.is_some() {
            let _ = respond.send(Err(EventError::ConnectionRegistrationExists));
            return;
        }
        let id = session.core.registrations_mut().next_id();
        session.connection_reg = Some((id, sender));
        debug!(id, "registered for connection events");
        let _ = respond.send(Ok(Registration::Connection { id }));
    }
    .boxed()
}

/// Handles connection registrations, delegates the rest.
fn handle_unregister_connection(session: &mut Session, event: Event) -> BoxFuture<'_, ()> {
    async move {
        if let Event::Unregister {
            registration: Registration::Connection { id },
        } = &event
        {
            match &session.connection_reg {
                Some((current, _)) if current == id => {
                    session.connection_reg = None;
                    debug!(id, "unregistered connection events");
                }
                _ => warn!(id, "unknown connection registration"),
            }
            return;
        }
        handle_unregister(session, event).await;
    }
    .boxed()
}

/// Drops the connection subscriber and the connection, then stops.
fn handle_stop_client(session: &mut Session, event: Event) -> BoxFuture<'_, ()> {
    async move {
        session.connection_reg = None;
        if session.close_connection() {
            debug!("closed event connection on stop");
        }
        handle_stop(session, event).await;
    }
    .boxed()
}

fn handlers() -> HandlerTable<Session> {
    let mut table = HandlerTable::<Session>::with_base_handlers();
    table.register(EventKind::Connect, handle_connect);
    table.register(EventKind::Disconnect, handle_disconnect);
    table.register(EventKind::Connected, handle_connected);
    table.register(EventKind::Disconnected, handle_disconnected);
    table.register(EventKind::RegisterConnection, handle_register_connection);
    table.register(EventKind::Unregister, handle_unregister_connection);
    table.register(EventKind::Stop, handle_stop_client);
    table
}

/// Event dispatcher that also owns the event connection.
pub struct ClientDispatcher {
    inner: EventDispatcher,
    channel_id: String,
    discovery: Arc<dyn DiscoveryService>,
    provider: Arc<dyn ConnectionProvider>,
    policy: Arc<dyn LoadBalancePolicy>,
}

impl ClientDispatcher {
    pub fn new(
        config: EventServiceConfig,
        channel_id: impl Into<String>,
        discovery: Arc<dyn DiscoveryService>,
        provider: Arc<dyn ConnectionProvider>,
        policy: Arc<dyn LoadBalancePolicy>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            inner: EventDispatcher::new(config)?,
            channel_id: channel_id.into(),
            discovery,
            provider,
            policy,
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn config(&self) -> &EventServiceConfig {
        self.inner.config()
    }

    pub fn start(&self) -> Result<(), EventError> {
        let channel_id = self.channel_id.clone();
        let discovery = Arc::clone(&self.discovery);
        let provider = Arc::clone(&self.provider);
        let policy = Arc::clone(&self.policy);
        let dial_timeout = self.config().response_timeout();
        self.inner.start_with(
            move |core, events| Session {
                core,
                events,
                channel_id,
                discovery,
                provider,
                policy,
                dial_timeout,
                connection: None,
                connection_reg: None,
            },
            handlers(),
        )
    }

    /// Stop the dispatcher, closing the connection and every registration.
    pub async fn stop(&self) -> Result<(), EventError> {
        self.inner.stop().await
    }

    /// Choose a peer and open a connection to it. Succeeds immediately if
    /// already connected. Opening the connection is bounded by the response
    /// timeout.
    pub async fn connect(&self) -> Result<(), EventError> {
        self.inner
            .request("connect", None, |respond| Event::Connect { respond })
            .await
    }

    /// Close the current connection. Fails if there is none.
    pub async fn disconnect(&self) -> Result<(), EventError> {
        self.inner
            .request("disconnect", Some(self.config().response_timeout()), |respond| {
                Event::Disconnect { respond }
            })
            .await
    }

    /// Tell the connection subscriber that the client is connected.
    pub async fn notify_connected(&self) -> Result<(), EventError> {
        self.inner
            .event_ch()?
            .send(Event::Connected)
            .await
            .map_err(|_| EventError::DispatcherStopped)
    }

    /// Register the single connection-event subscriber.
    pub async fn register_connection_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<ConnectionEvent>), EventError> {
        let (sender, receiver) = mpsc::channel(self.config().event_consumer_buffer_size);
        let reg = self
            .inner
            .request(
                "register connection event",
                Some(self.config().response_timeout()),
                |respond| Event::RegisterConnection { sender, respond },
            )
            .await?;
        Ok((reg, receiver))
    }

    pub async fn register_block_event(
        &self,
        filter: BlockFilter,
    ) -> Result<(Registration, mpsc::Receiver<BlockEvent>), EventError> {
        self.inner.register_block_event(filter).await
    }

    pub async fn register_filtered_block_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<FilteredBlockEvent>), EventError> {
        self.inner.register_filtered_block_event().await
    }

    pub async fn register_tx_status_event(
        &self,
        tx_id: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<TxStatusEvent>), EventError> {
        self.inner.register_tx_status_event(tx_id).await
    }

    pub async fn register_chaincode_event(
        &self,
        chaincode_id: impl Into<String>,
        event_filter: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<CcEvent>), EventError> {
        self.inner
            .register_chaincode_event(chaincode_id, event_filter)
            .await
    }

    pub async fn unregister(&self, registration: Registration) {
        self.inner.unregister(registration).await
    }

    pub async fn registration_info(&self) -> Result<RegistrationInfo, EventError> {
        self.inner.registration_info().await
    }

    pub async fn last_block_num(&self) -> Result<Option<u64>, EventError> {
        self.inner.last_block_num().await
    }
}
