//! # PMR Dispatcher Service
//!
//! Thread-safe event dispatching over a bounded worker pool, coordinated with
//! the cooperative collector in `pmr_mem`.
//!
//! ## Overview
//!
//! A [`Dispatcher`] is a serial execution context: a named queue of events
//! sorted by due time. Events on one dispatcher run strictly in due-time
//! order (FIFO for ties) and never concurrently; events on different
//! dispatchers run in parallel on pool workers.
//!
//! The [`EventService`] owns five dispatcher queues: *run* (executing),
//! *ready* (due, awaiting a worker), *wait* (future events), *pending* (due
//! but the pool was saturated) and *idle*. [`EventService::service_events`]
//! drains ready dispatchers onto workers and then parks in the installed
//! [`Notifier`] until the next due time, so an I/O layer can wake the loop on
//! descriptor readiness.
//!
//! Worker threads sticky-yield to the collector before parking, so an idle
//! pool never delays a collection. Threads outside the runtime enqueue events
//! through [`EventService::create_event_outside`], which cooperates with the
//! collector's pause counter instead of the yield protocol.

mod dispatcher;
mod error;
mod event;
mod notify;
mod service;
mod worker;

pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use event::{Event, EventFlags, EventProc};
pub use notify::{CondNotifier, Notifier};
pub use service::{EVENT_SERVICE, EventService, ServiceFlags, event_service};
pub use worker::{
    DEFAULT_PRIORITY, PRUNE_TIMEOUT_MS, Worker, WorkerProc, WorkerService, WorkerState,
    WorkerStats,
};
