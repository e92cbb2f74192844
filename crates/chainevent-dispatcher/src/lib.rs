//! chainevent-dispatcher — single-task event dispatcher for ChainEvent.
//!
//! # Features
//! - One ordered input queue for registrations and block notifications
//! - Block, filtered block, tx status and chaincode event registrations
//! - Block-number watermark that drops stale or duplicate blocks
//! - Configurable backpressure when a consumer falls behind
//! - Extensible handler table (see [`Dispatch`] and [`HandlerTable`])

pub mod dispatcher;
pub mod event;
pub mod publish;
pub mod registration;

pub use dispatcher::{Dispatch, DispatcherCore, EventDispatcher, Handler, HandlerTable, Lifecycle};
pub use event::{BlockFilter, Event, EventKind, Responder};
pub use publish::publish;
pub use registration::{Registration, RegistrationInfo, RegistrationTable};
