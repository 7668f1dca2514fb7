//! Bounded-concurrency task scheduling for Loresmith.
//!
//! This crate provides:
//! - [`Semaphore`] — FIFO concurrency-limiting primitive with hard cancellation
//! - [`TaskScheduler`] — executes an async worker over an ordered input list
//!   under serial/independent/batch strategies with retry and status tracking

pub mod scheduler;
pub mod semaphore;

pub use scheduler::{
    BatchOutcome, SchedulerObserver, SilentObserver, TaskScheduler, TaskStatus,
};
pub use semaphore::{Permit, Semaphore};
