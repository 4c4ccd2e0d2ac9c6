//! Delivery scenarios. Every scenario runs against `MemoryTransport`, most of
//! them on a paused clock so ack-wait and backoff delays elapse instantly.

pub mod backpressure;
pub mod dead_letters;
pub mod delivery;
pub mod recovery;
