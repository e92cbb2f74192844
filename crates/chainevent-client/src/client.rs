//! Event client: connection state machine, retry and auto-reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use chainevent_core::{
    BlockEvent, CcEvent, ConnectionEvent, DiscoveryService, EventError, EventServiceConfig,
    FilteredBlockEvent, LoadBalancePolicy, TxStatusEvent,
};
use chainevent_dispatcher::{publish, BlockFilter, Registration, RegistrationInfo};

use crate::connection::ConnectionProvider;
use crate::dispatcher::ClientDispatcher;
use crate::state::{AtomicConnectionState, ConnectionState};

/// Caller-supplied callback run around connection attempts.
pub type Hook = Arc<dyn Fn() -> Result<(), EventError> + Send + Sync>;

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: EventServiceConfig,
    channel_id: String,
    discovery: Arc<dyn DiscoveryService>,
    provider: Arc<dyn ConnectionProvider>,
    policy: Option<Arc<dyn LoadBalancePolicy>>,
    permit_block_events: bool,
    after_connect: Option<Hook>,
    before_reconnect: Option<Hook>,
    connection_events: Option<mpsc::Sender<ConnectionEvent>>,
}

impl ClientBuilder {
    pub fn new(
        channel_id: impl Into<String>,
        discovery: Arc<dyn DiscoveryService>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            config: EventServiceConfig::default(),
            channel_id: channel_id.into(),
            discovery,
            provider,
            policy: None,
            permit_block_events: false,
            after_connect: None,
            before_reconnect: None,
            connection_events: None,
        }
    }

    pub fn config(mut self, config: EventServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the policy named in the configuration.
    pub fn load_balance_policy(mut self, policy: Arc<dyn LoadBalancePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Allow registrations for full blocks.
    pub fn permit_block_events(mut self) -> Self {
        self.permit_block_events = true;
        self
    }

    /// Run after every successful connect. An error aborts the connect.
    pub fn after_connect(
        mut self,
        hook: impl Fn() -> Result<(), EventError> + Send + Sync + 'static,
    ) -> Self {
        self.after_connect = Some(Arc::new(hook));
        self
    }

    /// Run before every reconnect. An error aborts the reconnect.
    pub fn before_reconnect(
        mut self,
        hook: impl Fn() -> Result<(), EventError> + Send + Sync + 'static,
    ) -> Self {
        self.before_reconnect = Some(Arc::new(hook));
        self
    }

    /// Receive connection state changes on `sender`. The client drops it on
    /// close, so the receiver ends if this was the only sender.
    pub fn connection_events(mut self, sender: mpsc::Sender<ConnectionEvent>) -> Self {
        self.connection_events = Some(sender);
        self
    }

    /// Start the dispatcher and return the (not yet connected) client.
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<Client, EventError> {
        let policy = self
            .policy
            .unwrap_or_else(|| self.config.load_balance.build());
        let dispatcher = ClientDispatcher::new(
            self.config.clone(),
            self.channel_id,
            self.discovery,
            self.provider,
            policy,
        )?;
        dispatcher.start()?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                dispatcher,
                state: AtomicConnectionState::default(),
                closed: watch::channel(false).0,
                monitor_started: AtomicBool::new(false),
                permit_block_events: self.permit_block_events,
                after_connect: self.after_connect,
                before_reconnect: self.before_reconnect,
                sink: Mutex::new(self.connection_events),
            }),
        })
    }
}

struct ClientInner {
    config: EventServiceConfig,
    dispatcher: ClientDispatcher,
    state: AtomicConnectionState,
    closed: watch::Sender<bool>,
    monitor_started: AtomicBool,
    permit_block_events: bool,
    after_connect: Option<Hook>,
    before_reconnect: Option<Hook>,
    sink: Mutex<Option<mpsc::Sender<ConnectionEvent>>>,
}

/// Event client for one ledger channel.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(
        channel_id: impl Into<String>,
        discovery: Arc<dyn DiscoveryService>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> ClientBuilder {
        ClientBuilder::new(channel_id, discovery, provider)
    }

    /// Connect, retrying up to `max_connect_attempts` times (0 = until
    /// closed).
    pub async fn connect(&self) -> Result<(), EventError> {
        let max_attempts = self.inner.config.max_connect_attempts;
        if max_attempts == 1 {
            return self.inner.connect_once().await;
        }
        connect_with_retry(&self.inner, max_attempts).await
    }

    /// Close the client permanently. Idempotent. A connect or reconnect in
    /// progress on another task returns [`EventError::ClientClosed`].
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Close the client if it has no registrations. Returns whether it
    /// closed.
    pub async fn close_if_idle(&self) -> bool {
        match self.inner.dispatcher.registration_info().await {
            Ok(info) if info.total > 0 => {
                debug!(registrations = info.total, "event client not idle");
                false
            }
            Ok(_) => {
                self.close().await;
                true
            }
            Err(e) => {
                warn!(error = %e, "unable to query registrations");
                false
            }
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn channel_id(&self) -> &str {
        self.inner.dispatcher.channel_id()
    }

    /// Fails with [`EventError::BlockEventsNotPermitted`] unless the client
    /// was built with block events permitted.
    pub async fn register_block_event(
        &self,
        filter: BlockFilter,
    ) -> Result<(Registration, mpsc::Receiver<BlockEvent>), EventError> {
        if !self.inner.permit_block_events {
            return Err(EventError::BlockEventsNotPermitted);
        }
        self.inner.dispatcher.register_block_event(filter).await
    }

    pub async fn register_filtered_block_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<FilteredBlockEvent>), EventError> {
        self.inner.dispatcher.register_filtered_block_event().await
    }

    pub async fn register_tx_status_event(
        &self,
        tx_id: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<TxStatusEvent>), EventError> {
        self.inner.dispatcher.register_tx_status_event(tx_id).await
    }

    pub async fn register_chaincode_event(
        &self,
        chaincode_id: impl Into<String>,
        event_filter: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<CcEvent>), EventError> {
        self.inner
            .dispatcher
            .register_chaincode_event(chaincode_id, event_filter)
            .await
    }

    pub async fn unregister(&self, registration: Registration) {
        self.inner.dispatcher.unregister(registration).await
    }

    pub async fn registration_info(&self) -> Result<RegistrationInfo, EventError> {
        self.inner.dispatcher.registration_info().await
    }

    pub async fn last_block_num(&self) -> Result<Option<u64>, EventError> {
        self.inner.dispatcher.last_block_num().await
    }
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`ClientInner::close`] has started.
    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return;
            }
            // The sender lives in `self`, so this never fails while waiting.
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// A single connect attempt.
    async fn connect_once(self: &Arc<Self>) -> Result<(), EventError> {
        if self.is_closed() {
            return Err(EventError::ClientClosed);
        }

        // Subscribe before the first connection exists so no disconnect is
        // missed.
        if !self.monitor_started.swap(true, Ordering::AcqRel) {
            match self.dispatcher.register_connection_event().await {
                Ok((_reg, events)) => {
                    tokio::spawn(monitor(Arc::clone(self), events));
                }
                Err(e) => {
                    error!(error = %e, "unable to register for connection events, closing");
                    self.close().await;
                    return Err(e);
                }
            }
        }

        if let Err(current) = self
            .state
            .compare_and_set(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(EventError::ConnectInProgress {
                state: current.to_string(),
            });
        }

        debug!("submitting connect request");
        let connected = tokio::select! {
            result = self.dispatcher.connect() => result,
            () = self.wait_closed() => Err(EventError::ClientClosed),
        };
        if let Err(e) = connected {
            self.state.set(ConnectionState::Disconnected);
            return Err(e);
        }

        if let Some(hook) = &self.after_connect {
            if let Err(e) = hook() {
                warn!(error = %e, "after-connect handler failed, disconnecting");
                if let Err(e) = self.dispatcher.disconnect().await {
                    warn!(error = %e, "disconnect after failed handler");
                }
                self.state.set(ConnectionState::Disconnected);
                return Err(EventError::Hook {
                    hook: "after-connect".into(),
                    reason: e.to_string(),
                });
            }
        }

        if let Err(current) = self
            .state
            .compare_and_set(ConnectionState::Connecting, ConnectionState::Connected)
        {
            warn!(state = %current, "connection lost while connecting");
            return Err(EventError::ConnectionClosed);
        }

        if let Err(e) = self.dispatcher.notify_connected().await {
            warn!(error = %e, "unable to post connected event");
        }
        info!(channel = %self.dispatcher.channel_id(), "event client connected");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            debug!("event client already closed");
            return;
        }
        info!(channel = %self.dispatcher.channel_id(), "closing event client");

        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Err(e) = self.dispatcher.disconnect().await {
            debug!(error = %e, "disconnect on close");
        }
        if let Err(e) = self.dispatcher.stop().await {
            warn!(error = %e, "unable to stop dispatcher");
        }
        self.state.set(ConnectionState::Disconnected);
        info!("event client closed");
    }

    async fn forward(&self, event: ConnectionEvent) {
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            publish(&sink, event, self.config.backpressure(), "connection").await;
        }
    }
}

/// Retry loop shared by connect and reconnect. `max_attempts == 0` retries
/// until the client is closed.
async fn connect_with_retry(
    client: &Arc<ClientInner>,
    max_attempts: u32,
) -> Result<(), EventError> {
    let interval = client.config.time_between_connect_attempts();
    let mut attempts = 0u32;
    loop {
        if client.state.get() == ConnectionState::Connected {
            debug!(attempts, "already connected, ending connect loop");
            return Ok(());
        }
        attempts += 1;
        let err = match client.connect_once().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if client.is_closed() {
            return Err(EventError::ClientClosed);
        }
        if max_attempts != 0 && attempts >= max_attempts {
            warn!(attempts, error = %err, "maximum connect attempts exceeded");
            return Err(EventError::MaxConnectAttemptsExceeded { attempts });
        }
        warn!(
            attempt = attempts,
            error = %err,
            retry_in_ms = interval.as_millis() as u64,
            "connect attempt failed"
        );
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = client.wait_closed() => return Err(EventError::ClientClosed),
        }
    }
}

/// Consumes connection notifications for the client's lifetime.
async fn monitor(client: Arc<ClientInner>, mut events: mpsc::Receiver<ConnectionEvent>) {
    debug!("connection monitor started");
    while let Some(event) = events.recv().await {
        if client.is_closed() {
            break;
        }
        client.forward(event.clone()).await;

        if event.connected {
            debug!("event client has connected");
            continue;
        }

        if !client.config.reconnect {
            warn!(error = ?event.error, "event client disconnected, closing");
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.close().await });
            break;
        }

        warn!(error = ?event.error, "event client disconnected");
        if client
            .state
            .compare_and_set(ConnectionState::Connected, ConnectionState::Disconnected)
            .is_ok()
        {
            info!("attempting to reconnect");
            tokio::spawn(reconnect(Arc::clone(&client)));
        } else if client
            .state
            .compare_and_set(ConnectionState::Connecting, ConnectionState::Disconnected)
            .is_ok()
        {
            debug!("connect in progress, state set to disconnected");
        }
    }
    debug!("connection monitor exited");
}

fn reconnect(client: Arc<ClientInner>) -> BoxFuture<'static, ()> {
    async move {
        let delay = client.config.reconnect_initial_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            tokio::time::sleep(delay).await;
        }
        if client.is_closed() {
            debug!("client closed before reconnect");
            return;
        }
        if client.state.get() == ConnectionState::Connected {
            debug!("already connected, skipping reconnect");
            return;
        }

        if let Some(hook) = &client.before_reconnect {
            if let Err(e) = hook() {
                warn!(error = %e, "before-reconnect handler failed, aborting reconnect");
                return;
            }
        }

        match connect_with_retry(&client, client.config.max_reconnect_attempts).await {
            Ok(()) => info!("event client reconnected"),
            Err(EventError::ClientClosed) => debug!("client closed during reconnect"),
            Err(e) => {
                error!(error = %e, "reconnect failed, closing event client");
                client.close().await;
            }
        }
    }
    .boxed()
}
