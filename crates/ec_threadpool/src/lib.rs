//! A work-stealing fork-join scheduler for microsecond-scale tasks.
//!
//! This crate is the concurrency core of the library: the elliptic-curve,
//! pairing and polynomial-commitment routines submit tasks here and await
//! their results. Tasks are heap blocks of a fixed header plus an inline,
//! type-erased environment; workers own one deque each and steal from random
//! victims when theirs runs dry.
//!
//! ## Execution model
//!
//! One OS thread per worker; threads never migrate, only tasks do. A task
//! body runs to completion on one worker: there is no suspension inside a
//! body, and blocking operations ([`Flowvar::sync`], [`sync_scope`], the
//! parallel loops) make the blocked worker execute other tasks instead of
//! idling. Idle workers park on a global [`EventCount`] after a two-phase
//! sleepy/commit protocol; a worker awaiting one specific task parks on a
//! per-worker [`EventNotifier`] published into that task's header.
//!
//! ## Data parallelism
//!
//! [`parallel_for`] and [`parallel_reduce`] do not pre-partition their
//! ranges. The running chunk polls a geometrically backed-off check and
//! splits off ±1-balanced chunks only when other workers are observably
//! idle, so nested fine-grained loops on a busy pool degenerate to cheap
//! sequential execution. Reduction partials are merged through a per-task
//! DAG of awaitable handles, in reverse split order.
//!
//! ## Entry points
//!
//! Construct a [`Threadpool`] (its thread becomes worker 0), then use either
//! the pool methods or the free functions ([`spawn`], [`spawn_with_handle`],
//! [`spawn_awaitable`], [`parallel_for`], [`parallel_reduce`],
//! [`sync_scope`]); the free functions act on the pool owning the current
//! thread and are the way tasks spawn nested work.
//!
//! [`EventCount`]: ec_sync::EventCount
//! [`EventNotifier`]: ec_sync::EventNotifier
#![cfg_attr(docsrs, feature(doc_cfg))]

// -----------------------------------------------------------------------------
// Modules

mod balancer;
mod barrier;
mod context;
mod error;
mod flowvar;
mod metrics;
mod pool;
mod rng;
mod task;
mod worker;

// -----------------------------------------------------------------------------
// Exports

pub use error::BuildError;
pub use flowvar::Flowvar;
pub use pool::{
    Threadpool, ThreadpoolBuilder, parallel_for, parallel_for_strided, parallel_reduce, spawn,
    spawn_awaitable, spawn_with_handle, sync_scope,
};
