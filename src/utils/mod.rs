//! Cross-cutting helpers: tracing bootstrap, metric instruments, backoff.

pub mod bootstrap;
pub mod metrics;
pub mod retry;
