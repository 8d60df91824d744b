//! Per-session event loop over the durable job store.
//!
//! A [`SessionMessages`] is the consumer half of the queue: it claims the
//! next job of one session, suspending on the session notifier when the
//! queue is empty. Producers write to the store first and raise the
//! notifier afterwards, so a wake-up always refers to persisted work.

mod processor;

pub use processor::SessionMessages;
