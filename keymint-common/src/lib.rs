//! Foundational types shared by every keymint crate: monetary amounts, ids,
//! timestamps, status enums, entity records, configuration, and small async
//! utilities.

/// Monetary amounts in integer minor units.
pub mod amount;
/// Exponential backoff iterator.
pub mod backoff;
/// Typed configuration, validated from the environment at startup.
pub mod config;
/// Status enums and the payment provider enum.
pub mod enums;
/// Entity id newtypes.
pub mod ids;
/// `tracing` subscriber initialization.
pub mod logger;
/// Plain value records for the persisted entities.
pub mod records;
/// Shutdown signal channel.
pub mod shutdown;
/// Named task helpers.
pub mod task;
/// Millisecond unix timestamps.
pub mod time;
