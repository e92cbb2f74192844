//! Single-task event dispatcher.
//!
//! All registration requests and all inbound block notifications go through
//! one ordered input queue. The dispatcher task is the only owner of the
//! [`RegistrationTable`] and the block-number watermark, so handlers mutate
//! them without locking.
//!
//! Behaviour is a table of [`Handler`]s keyed by [`EventKind`]. Extensions
//! (the client dispatcher) wrap [`DispatcherCore`] in their own state type,
//! implement [`Dispatch`] for it and register additional or overriding
//! handlers before calling [`EventDispatcher::start_with`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use chainevent_core::{
    to_filtered_block, Backpressure, BlockEvent, CcEvent, EventError, EventServiceConfig,
    FilteredBlock, FilteredBlockEvent, TxStatusEvent,
};

use crate::event::{BlockFilter, Event, EventKind, Responder};
use crate::publish::publish;
use crate::registration::{Registration, RegistrationInfo, RegistrationTable};

/// Handler for one event kind. Runs on the dispatcher task.
pub type Handler<S> = for<'a> fn(&'a mut S, Event) -> BoxFuture<'a, ()>;

/// State types driven by the dispatcher loop.
pub trait Dispatch: Send + 'static {
    fn core(&mut self) -> &mut DispatcherCore;
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Initial = 0,
    Started = 1,
    Stopped = 2,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initial,
            1 => Self::Started,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ─── DispatcherCore ──────────────────────────────────────────────────────────

/// State owned by the dispatcher task.
pub struct DispatcherCore {
    registrations: RegistrationTable,
    last_block_num: Option<u64>,
    backpressure: Backpressure,
    stopped: bool,
}

impl DispatcherCore {
    pub fn new(backpressure: Backpressure) -> Self {
        Self {
            registrations: RegistrationTable::new(),
            last_block_num: None,
            backpressure,
            stopped: false,
        }
    }

    pub fn registrations(&self) -> &RegistrationTable {
        &self.registrations
    }

    pub fn registrations_mut(&mut self) -> &mut RegistrationTable {
        &mut self.registrations
    }

    /// Highest block number accepted so far.
    pub fn last_block_num(&self) -> Option<u64> {
        self.last_block_num
    }

    pub fn backpressure(&self) -> Backpressure {
        self.backpressure
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Advance the watermark to `number`, or reject it if it does not move
    /// forward.
    fn accept_block_number(&mut self, number: u64) -> bool {
        if let Some(last) = self.last_block_num {
            if number <= last {
                warn!(
                    block = number,
                    last_block = last,
                    "expected block number greater than last block number, dropping block"
                );
                return false;
            }
        }
        self.last_block_num = Some(number);
        true
    }

    /// Fan a filtered block out to filtered-block, tx-status and chaincode
    /// subscribers.
    async fn publish_filtered_block(&self, block: Arc<FilteredBlock>, source_url: &str) {
        let backpressure = self.backpressure();

        for reg in self.registrations.filtered_blocks() {
            let event = FilteredBlockEvent {
                filtered_block: Arc::clone(&block),
                source_url: source_url.to_owned(),
            };
            publish(&reg.sender, event, backpressure, "filtered_block").await;
        }

        for tx in &block.transactions {
            if let Some(reg) = self.registrations.tx_status(&tx.tx_id) {
                let event = TxStatusEvent {
                    tx_id: tx.tx_id.clone(),
                    validation_code: tx.validation_code,
                    block_number: block.number,
                    source_url: source_url.to_owned(),
                };
                publish(&reg.sender, event, backpressure, "tx_status").await;
            }

            if !tx.validation_code.is_valid() {
                continue;
            }
            for cc in &tx.chaincode_events {
                for reg in self
                    .registrations
                    .chaincode_matches(&cc.chaincode_id, &cc.event_name)
                {
                    let event = CcEvent {
                        tx_id: cc.tx_id.clone(),
                        chaincode_id: cc.chaincode_id.clone(),
                        event_name: cc.event_name.clone(),
                        payload: cc.payload.clone(),
                        block_number: block.number,
                        source_url: source_url.to_owned(),
                    };
                    publish(&reg.sender, event, backpressure, "chaincode").await;
                }
            }
        }
    }
}

impl Dispatch for DispatcherCore {
    fn core(&mut self) -> &mut DispatcherCore {
        self
    }
}

// ─── Handler table ───────────────────────────────────────────────────────────

/// Event kind → handler map consulted by the dispatcher loop.
pub struct HandlerTable<S> {
    handlers: HashMap<EventKind, Handler<S>>,
}

impl<S: Dispatch> HandlerTable<S> {
    /// An empty table; events with no handler are logged and dropped.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Table pre-populated with the registration, delivery and stop handlers.
    pub fn with_base_handlers() -> Self {
        let mut table = Self::new();
        table.register(EventKind::RegisterBlock, handle_register_block::<S>);
        table.register(EventKind::RegisterFilteredBlock, handle_register_filtered_block::<S>);
        table.register(EventKind::RegisterTxStatus, handle_register_tx_status::<S>);
        table.register(EventKind::RegisterChaincode, handle_register_chaincode::<S>);
        table.register(EventKind::Unregister, handle_unregister::<S>);
        table.register(EventKind::RegistrationInfo, handle_registration_info::<S>);
        table.register(EventKind::LastBlockNum, handle_last_block_num::<S>);
        table.register(EventKind::Block, handle_block::<S>);
        table.register(EventKind::FilteredBlock, handle_filtered_block::<S>);
        table.register(EventKind::Stop, handle_stop::<S>);
        table
    }

    /// Install `handler` for `kind`, returning the handler it replaced.
    pub fn register(&mut self, kind: EventKind, handler: Handler<S>) -> Option<Handler<S>> {
        self.handlers.insert(kind, handler)
    }

    pub fn get(&self, kind: EventKind) -> Option<Handler<S>> {
        self.handlers.get(&kind).copied()
    }
}

impl<S: Dispatch> Default for HandlerTable<S> {
    fn default() -> Self {
        Self::with_base_handlers()
    }
}

// ─── Base handlers ───────────────────────────────────────────────────────────

pub fn handle_register_block<S: Dispatch>(state: &mut S, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::RegisterBlock { filter, sender, respond } = event else {
            return;
        };
        let reg = state.core().registrations.add_block(filter, sender);
        debug!(registration = ?reg, "registered for block events");
        let _ = respond.send(Ok(reg));
    }
    .boxed()
}

pub fn handle_register_filtered_block<S: Dispatch>(
    state: &mut S,
    event: Event,
) -> BoxFuture<'_, ()> {
    async move {
        let Event::RegisterFilteredBlock { sender, respond } = event else {
            return;
        };
        let reg = state.core().registrations.add_filtered_block(sender);
        debug!(registration = ?reg, "registered for filtered block events");
        let _ = respond.send(Ok(reg));
    }
    .boxed()
}

pub fn handle_register_tx_status<S: Dispatch>(state: &mut S, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::RegisterTxStatus { tx_id, sender, respond } = event else {
            return;
        };
        let result = state.core().registrations.add_tx_status(tx_id, sender);
        match &result {
            Ok(reg) => debug!(registration = ?reg, "registered for tx status events"),
            Err(e) => debug!(error = %e, "tx status registration rejected"),
        }
        let _ = respond.send(result);
    }
    .boxed()
}

pub fn handle_register_chaincode<S: Dispatch>(state: &mut S, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::RegisterChaincode {
            chaincode_id,
            event_filter,
            sender,
            respond,
        } = event
        else {
            return;
        };
        let result = state
            .core()
            .registrations
            .add_chaincode(chaincode_id, event_filter, sender);
        match &result {
            Ok(reg) => debug!(registration = ?reg, "registered for chaincode events"),
            Err(e) => debug!(error = %e, "chaincode registration rejected"),
        }
        let _ = respond.send(result);
    }
    .boxed()
}

pub fn handle_unregister<S: Dispatch>(state: &mut S, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::Unregister { registration } = event else {
            return;
        };
        if let Registration::Connection { .. } = registration {
            warn!(?registration, "connection registrations are not handled by this dispatcher");
            return;
        }
        if state.core().registrations.remove(&registration) {
            debug!(?registration, "unregistered");
        } else {
            warn!(?registration, "unsupported or unknown registration");
        }
    }
    .boxed()
}

pub fn handle_registration_info<S: Dispatch>(state: &mut S, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::RegistrationInfo { respond } = event else {
            return;
        };
        let _ = respond.send(Ok(state.core().registrations.info()));
    }
    .boxed()
}

pub fn handle_last_block_num<S: Dispatch>(state: &mut S, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::LastBlockNum { respond } = event else {
            return;
        };
        let _ = respond.send(Ok(state.core().last_block_num));
    }
    .boxed()
}

/// Publish a raw block to matching block subscribers, then derive its
/// filtered block and publish that too.
pub fn handle_block<S: Dispatch>(state: &mut S, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::Block { block, source_url } = event else {
            return;
        };
        let core = state.core();
        if !core.accept_block_number(block.number) {
            return;
        }
        debug!(block = block.number, source = %source_url, "handling block");

        let block = Arc::new(block);
        let backpressure = core.backpressure();
        for reg in core.registrations.blocks() {
            if !reg.filter.matches(&block) {
                continue;
            }
            let event = BlockEvent {
                block: Arc::clone(&block),
                source_url: source_url.clone(),
            };
            publish(&reg.sender, event, backpressure, "block").await;
        }

        let filtered = Arc::new(to_filtered_block(&block));
        core.publish_filtered_block(filtered, &source_url).await;
    }
    .boxed()
}

pub fn handle_filtered_block<S: Dispatch>(state: &mut S, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::FilteredBlock { block, source_url } = event else {
            return;
        };
        let core = state.core();
        if !core.accept_block_number(block.number) {
            return;
        }
        debug!(block = block.number, source = %source_url, "handling filtered block");
        core.publish_filtered_block(Arc::new(block), &source_url).await;
    }
    .boxed()
}

/// Close every registration and mark the loop for exit.
pub fn handle_stop<S: Dispatch>(state: &mut S, event: Event) -> BoxFuture<'_, ()> {
    async move {
        let Event::Stop { respond } = event else {
            return;
        };
        let core = state.core();
        let info = core.registrations.info();
        info!(registrations = info.total, "stopping event dispatcher");
        core.registrations.clear();
        core.stopped = true;
        let _ = respond.send(Ok(()));
    }
    .boxed()
}

// ─── Loop ────────────────────────────────────────────────────────────────────

async fn run<S: Dispatch>(mut state: S, handlers: HandlerTable<S>, mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        let kind = event.kind();
        match handlers.get(kind) {
            Some(handler) => handler(&mut state, event).await,
            None => warn!(?kind, "no handler for event"),
        }
        if state.core().stopped {
            rx.close();
            break;
        }
    }
    debug!("event dispatcher loop exited");
}

// ─── EventDispatcher ─────────────────────────────────────────────────────────

/// Handle to a dispatcher task.
///
/// Registration methods post a request to the task and wait for its answer.
/// Each returns the registration handle and the receiving end of the
/// consumer's output queue; the queue closes when the registration is
/// removed or the dispatcher stops.
pub struct EventDispatcher {
    config: EventServiceConfig,
    lifecycle: AtomicU8,
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl EventDispatcher {
    pub fn new(config: EventServiceConfig) -> Result<Self, EventError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.input_queue_size);
        Ok(Self {
            config,
            lifecycle: AtomicU8::new(Lifecycle::Initial as u8),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    pub fn config(&self) -> &EventServiceConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Start the dispatcher task with the base handlers.
    pub fn start(&self) -> Result<(), EventError> {
        self.start_with(|core, _| core, HandlerTable::with_base_handlers())
    }

    /// Start the dispatcher task over a custom state type.
    ///
    /// `init` receives the fresh [`DispatcherCore`] and a sender onto the
    /// input queue, for state that needs to post events to itself.
    pub fn start_with<S, F>(&self, init: F, handlers: HandlerTable<S>) -> Result<(), EventError>
    where
        S: Dispatch,
        F: FnOnce(DispatcherCore, mpsc::Sender<Event>) -> S,
    {
        if let Err(current) = self.lifecycle.compare_exchange(
            Lifecycle::Initial as u8,
            Lifecycle::Started as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(EventError::DispatcherAlreadyStarted {
                state: Lifecycle::from_u8(current).to_string(),
            });
        }

        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| EventError::Other("dispatcher input queue already taken".into()))?;

        let core = DispatcherCore::new(self.config.backpressure());
        let state = init(core, self.tx.clone());
        tokio::spawn(run(state, handlers, rx));

        info!(
            input_queue = self.config.input_queue_size,
            buffer = self.config.event_consumer_buffer_size,
            "event dispatcher started"
        );
        Ok(())
    }

    /// Sender onto the input queue. Fails unless the dispatcher is started.
    pub fn event_ch(&self) -> Result<mpsc::Sender<Event>, EventError> {
        match self.lifecycle() {
            Lifecycle::Started => Ok(self.tx.clone()),
            Lifecycle::Initial => Err(EventError::DispatcherNotStarted),
            Lifecycle::Stopped => Err(EventError::DispatcherStopped),
        }
    }

    /// Post a request built around a fresh responder and wait for the reply.
    ///
    /// With `timeout` set, the whole round-trip (enqueue and reply) is
    /// bounded by it.
    pub async fn request<T>(
        &self,
        operation: &'static str,
        timeout: Option<Duration>,
        build: impl FnOnce(Responder<T>) -> Event,
    ) -> Result<T, EventError> {
        let tx = self.event_ch()?;
        round_trip(&tx, operation, timeout, build).await
    }

    pub async fn register_block_event(
        &self,
        filter: BlockFilter,
    ) -> Result<(Registration, mpsc::Receiver<BlockEvent>), EventError> {
        let (sender, receiver) = mpsc::channel(self.config.event_consumer_buffer_size);
        let reg = self
            .request("register block event", Some(self.config.response_timeout()), |respond| {
                Event::RegisterBlock { filter, sender, respond }
            })
            .await?;
        Ok((reg, receiver))
    }

    pub async fn register_filtered_block_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<FilteredBlockEvent>), EventError> {
        let (sender, receiver) = mpsc::channel(self.config.event_consumer_buffer_size);
        let reg = self
            .request(
                "register filtered block event",
                Some(self.config.response_timeout()),
                |respond| Event::RegisterFilteredBlock { sender, respond },
            )
            .await?;
        Ok((reg, receiver))
    }

    /// Fails if `tx_id` already has a live registration.
    pub async fn register_tx_status_event(
        &self,
        tx_id: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<TxStatusEvent>), EventError> {
        let tx_id = tx_id.into();
        let (sender, receiver) = mpsc::channel(self.config.event_consumer_buffer_size);
        let reg = self
            .request(
                "register tx status event",
                Some(self.config.response_timeout()),
                |respond| Event::RegisterTxStatus { tx_id, sender, respond },
            )
            .await?;
        Ok((reg, receiver))
    }

    /// `event_filter` is a regular expression matched against event names.
    pub async fn register_chaincode_event(
        &self,
        chaincode_id: impl Into<String>,
        event_filter: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<CcEvent>), EventError> {
        let chaincode_id = chaincode_id.into();
        let event_filter = event_filter.into();
        let (sender, receiver) = mpsc::channel(self.config.event_consumer_buffer_size);
        let reg = self
            .request(
                "register chaincode event",
                Some(self.config.response_timeout()),
                |respond| Event::RegisterChaincode {
                    chaincode_id,
                    event_filter,
                    sender,
                    respond,
                },
            )
            .await?;
        Ok((reg, receiver))
    }

    /// Remove a registration and close its queue. Does not wait for the
    /// dispatcher to process the request.
    pub async fn unregister(&self, registration: Registration) {
        let tx = match self.event_ch() {
            Ok(tx) => tx,
            Err(e) => {
                warn!(?registration, error = %e, "cannot unregister");
                return;
            }
        };
        if tx.send(Event::Unregister { registration }).await.is_err() {
            debug!("dispatcher stopped before unregister was queued");
        }
    }

    pub async fn registration_info(&self) -> Result<RegistrationInfo, EventError> {
        self.request("registration info", Some(self.config.response_timeout()), |respond| {
            Event::RegistrationInfo { respond }
        })
        .await
    }

    /// Highest block number accepted so far, `None` before the first block.
    pub async fn last_block_num(&self) -> Result<Option<u64>, EventError> {
        self.request("last block number", Some(self.config.response_timeout()), |respond| {
            Event::LastBlockNum { respond }
        })
        .await
    }

    /// Stop the task, closing every registration's queue.
    ///
    /// A dispatcher that is not running is left as is and a warning logged.
    pub async fn stop(&self) -> Result<(), EventError> {
        if let Err(current) = self.lifecycle.compare_exchange(
            Lifecycle::Started as u8,
            Lifecycle::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            warn!(
                state = %Lifecycle::from_u8(current),
                "cannot stop event dispatcher, it is not running"
            );
            return Ok(());
        }
        debug!("posting stop to event dispatcher");
        round_trip(
            &self.tx,
            "stop",
            Some(self.config.response_timeout()),
            |respond| Event::Stop { respond },
        )
        .await
    }
}

async fn round_trip<T>(
    tx: &mpsc::Sender<Event>,
    operation: &'static str,
    timeout: Option<Duration>,
    build: impl FnOnce(Responder<T>) -> Event,
) -> Result<T, EventError> {
    let (respond, response) = oneshot::channel();
    let exchange = async move {
        tx.send(build(respond))
            .await
            .map_err(|_| EventError::DispatcherStopped)?;
        response.await.map_err(|_| EventError::DispatcherStopped)?
    };
    match timeout {
        None => exchange.await,
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| EventError::Timeout {
                operation: operation.to_owned(),
                ms: limit.as_millis() as u64,
            })?,
    }
}

#[cfg(test)]
mod tests {
    use chainevent_core::{
        Block, ChaincodeEvent, Envelope, FilteredTransaction, HeaderType, TxValidationCode,
    };

    use super::*;

    const PEER: &str = "grpcs://peer0.org1:7051";

    fn started() -> EventDispatcher {
        let dispatcher = EventDispatcher::new(EventServiceConfig::default()).unwrap();
        dispatcher.start().unwrap();
        dispatcher
    }

    fn filtered(number: u64, txs: Vec<FilteredTransaction>) -> FilteredBlock {
        FilteredBlock {
            channel_id: "mychannel".into(),
            number,
            transactions: txs,
        }
    }

    fn committed_tx(tx_id: &str, events: Vec<ChaincodeEvent>) -> FilteredTransaction {
        FilteredTransaction {
            tx_id: tx_id.into(),
            header_type: HeaderType::EndorserTransaction,
            validation_code: TxValidationCode::Valid,
            chaincode_events: events,
        }
    }

    fn cc_event(chaincode_id: &str, tx_id: &str, name: &str) -> ChaincodeEvent {
        ChaincodeEvent {
            chaincode_id: chaincode_id.into(),
            tx_id: tx_id.into(),
            event_name: name.into(),
            payload: b"payload".to_vec(),
        }
    }

    async fn post(dispatcher: &EventDispatcher, event: Event) {
        dispatcher.event_ch().unwrap().send(event).await.unwrap();
    }

    #[tokio::test]
    async fn event_ch_requires_started() {
        let dispatcher = EventDispatcher::new(EventServiceConfig::default()).unwrap();
        assert_eq!(dispatcher.event_ch().unwrap_err(), EventError::DispatcherNotStarted);
        dispatcher.start().unwrap();
        assert!(dispatcher.event_ch().is_ok());
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let dispatcher = started();
        assert!(matches!(
            dispatcher.start(),
            Err(EventError::DispatcherAlreadyStarted { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_registrations_rejected() {
        let dispatcher = started();
        let (first, _rx) = dispatcher.register_tx_status_event("tx1").await.unwrap();
        let err = dispatcher.register_tx_status_event("tx1").await.unwrap_err();
        assert_eq!(err, EventError::TxRegistrationExists { tx_id: "tx1".into() });

        dispatcher.register_chaincode_event("mycc", "ev.*").await.unwrap();
        assert!(matches!(
            dispatcher.register_chaincode_event("mycc", "ev.*").await,
            Err(EventError::ChaincodeRegistrationExists { .. })
        ));
        assert!(matches!(
            dispatcher.register_chaincode_event("mycc", "ev(").await,
            Err(EventError::InvalidEventFilter { .. })
        ));

        let info = dispatcher.registration_info().await.unwrap();
        assert_eq!(info.tx_status, 1);
        assert_eq!(info.chaincode, 1);

        // The first registration is still the live one.
        dispatcher.unregister(first).await;
        dispatcher.register_tx_status_event("tx1").await.unwrap();
    }

    #[tokio::test]
    async fn watermark_rejects_stale_blocks() {
        let dispatcher = started();
        let (_reg, mut rx) = dispatcher.register_filtered_block_event().await.unwrap();
        assert_eq!(dispatcher.last_block_num().await.unwrap(), None);

        for n in [0, 1, 2, 1, 2] {
            post(&dispatcher, Event::FilteredBlock {
                block: filtered(n, vec![]),
                source_url: PEER.into(),
            })
            .await;
        }
        assert_eq!(dispatcher.last_block_num().await.unwrap(), Some(2));

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev.filtered_block.number);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn raw_block_yields_block_and_filtered_pair() {
        let dispatcher = started();
        let (_b, mut blocks) = dispatcher
            .register_block_event(BlockFilter::accept_all())
            .await
            .unwrap();
        let (_f, mut filtered_rx) = dispatcher.register_filtered_block_event().await.unwrap();
        let (_o, mut odd_only) = dispatcher
            .register_block_event(BlockFilter::new(|b| b.number % 2 == 1))
            .await
            .unwrap();

        let envelopes = vec![
            (
                Envelope::endorser_transaction("mychannel", "tx1", vec![]),
                TxValidationCode::Valid,
            ),
            (Envelope::config("mychannel", "cfg1"), TxValidationCode::Valid),
        ];
        let mut block = Block::from_envelopes("mychannel", 4, envelopes);
        // A third, undecodable envelope is skipped by the transformation.
        block.data.push(b"not an envelope".to_vec());
        block.validation_flags.push(TxValidationCode::Valid.flag());
        post(&dispatcher, Event::Block { block, source_url: PEER.into() }).await;
        dispatcher.last_block_num().await.unwrap();

        let full = blocks.try_recv().unwrap();
        assert_eq!(full.block.tx_count(), 3);
        assert_eq!(full.source_url, PEER);
        assert!(blocks.try_recv().is_err());
        assert!(odd_only.try_recv().is_err());

        let derived = filtered_rx.try_recv().unwrap();
        assert_eq!(derived.filtered_block.number, 4);
        assert_eq!(derived.filtered_block.transactions.len(), 2);
        assert!(filtered_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn filtered_block_is_not_published_as_raw() {
        let dispatcher = started();
        let (_b, mut blocks) = dispatcher
            .register_block_event(BlockFilter::accept_all())
            .await
            .unwrap();
        let (_f, mut filtered_rx) = dispatcher.register_filtered_block_event().await.unwrap();

        post(&dispatcher, Event::FilteredBlock {
            block: filtered(1, vec![]),
            source_url: PEER.into(),
        })
        .await;
        dispatcher.last_block_num().await.unwrap();

        assert!(filtered_rx.try_recv().is_ok());
        assert!(blocks.try_recv().is_err());
    }

    #[tokio::test]
    async fn chaincode_event_delivered_once() {
        let dispatcher = started();
        let (_reg, mut events) = dispatcher
            .register_chaincode_event("mycc1", "event1")
            .await
            .unwrap();

        let block = filtered(
            7,
            vec![committed_tx("tx1", vec![cc_event("mycc1", "tx1", "event1")])],
        );
        post(&dispatcher, Event::FilteredBlock {
            block: block.clone(),
            source_url: PEER.into(),
        })
        .await;
        dispatcher.last_block_num().await.unwrap();

        let ev = events.try_recv().unwrap();
        assert_eq!(ev.chaincode_id, "mycc1");
        assert_eq!(ev.event_name, "event1");
        assert_eq!(ev.block_number, 7);
        assert!(events.try_recv().is_err());

        post(&dispatcher, Event::FilteredBlock { block, source_url: PEER.into() }).await;
        dispatcher.last_block_num().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn chaincode_events_fan_out_to_every_matching_pattern() {
        let dispatcher = started();
        let (_a, mut exact) = dispatcher
            .register_chaincode_event("mycc", "^transfer$")
            .await
            .unwrap();
        let (_b, mut any) = dispatcher.register_chaincode_event("mycc", ".*").await.unwrap();
        let (_c, mut other) = dispatcher.register_chaincode_event("othercc", ".*").await.unwrap();

        let mut rejected = committed_tx("tx2", vec![cc_event("mycc", "tx2", "transfer")]);
        rejected.validation_code = TxValidationCode::MvccReadConflict;
        let block = filtered(
            1,
            vec![
                committed_tx("tx1", vec![cc_event("mycc", "tx1", "transfer")]),
                rejected,
            ],
        );
        post(&dispatcher, Event::FilteredBlock { block, source_url: PEER.into() }).await;
        dispatcher.last_block_num().await.unwrap();

        assert_eq!(exact.try_recv().unwrap().tx_id, "tx1");
        assert!(exact.try_recv().is_err());
        assert_eq!(any.try_recv().unwrap().tx_id, "tx1");
        assert!(any.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn tx_status_delivered_for_each_block_until_unregistered() {
        let dispatcher = started();
        let (reg, mut status) = dispatcher.register_tx_status_event("tx1").await.unwrap();

        let mut rejected = committed_tx("tx1", vec![]);
        rejected.validation_code = TxValidationCode::MvccReadConflict;
        post(&dispatcher, Event::FilteredBlock {
            block: filtered(1, vec![rejected]),
            source_url: PEER.into(),
        })
        .await;
        post(&dispatcher, Event::FilteredBlock {
            block: filtered(2, vec![committed_tx("tx1", vec![])]),
            source_url: PEER.into(),
        })
        .await;
        dispatcher.last_block_num().await.unwrap();

        let first = status.try_recv().unwrap();
        assert_eq!(first.validation_code, TxValidationCode::MvccReadConflict);
        assert_eq!(first.block_number, 1);
        let second = status.try_recv().unwrap();
        assert_eq!(second.validation_code, TxValidationCode::Valid);

        dispatcher.unregister(reg).await;
        assert!(status.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_closes_all_queues() {
        let dispatcher = started();
        let (_a, mut blocks) = dispatcher
            .register_block_event(BlockFilter::accept_all())
            .await
            .unwrap();
        let (_b, mut filtered_rx) = dispatcher.register_filtered_block_event().await.unwrap();
        let (_c, mut status) = dispatcher.register_tx_status_event("tx1").await.unwrap();
        let (_d, mut cc) = dispatcher.register_chaincode_event("mycc", ".*").await.unwrap();

        dispatcher.stop().await.unwrap();
        assert_eq!(dispatcher.lifecycle(), Lifecycle::Stopped);
        assert!(blocks.recv().await.is_none());
        assert!(filtered_rx.recv().await.is_none());
        assert!(status.recv().await.is_none());
        assert!(cc.recv().await.is_none());

        assert_eq!(dispatcher.event_ch().unwrap_err(), EventError::DispatcherStopped);
        assert!(dispatcher.register_filtered_block_event().await.is_err());

        // Second stop is a logged no-op.
        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_event_kind_is_ignored() {
        let dispatcher = started();
        let (respond, response) = oneshot::channel();
        post(&dispatcher, Event::Connect { respond }).await;
        // The request is dropped unanswered; the loop keeps running.
        assert!(response.await.is_err());
        assert!(dispatcher.registration_info().await.is_ok());
    }

    #[tokio::test]
    async fn custom_handler_overrides_base() {
        fn deny_filtered(_: &mut DispatcherCore, event: Event) -> BoxFuture<'_, ()> {
            async move {
                if let Event::RegisterFilteredBlock { respond, .. } = event {
                    let _ = respond.send(Err(EventError::Other("denied".into())));
                }
            }
            .boxed()
        }

        let dispatcher = EventDispatcher::new(EventServiceConfig::default()).unwrap();
        let mut handlers = HandlerTable::<DispatcherCore>::with_base_handlers();
        assert!(handlers
            .register(EventKind::RegisterFilteredBlock, deny_filtered)
            .is_some());
        dispatcher.start_with(|core, _| core, handlers).unwrap();

        assert_eq!(
            dispatcher.register_filtered_block_event().await.unwrap_err(),
            EventError::Other("denied".into())
        );
        assert!(dispatcher.register_tx_status_event("tx").await.is_ok());
    }
}
