//! The realtime collaboration engine: room state, the pub/sub fabric, and
//! the per-feature handlers built on top of them.

pub mod approval;
pub mod batcher;
pub mod broadcast;
pub mod bus;
pub mod grace;
pub mod lifecycle;
pub mod messages;
pub mod metronome;
pub mod notes;
pub mod registry;
pub mod room;
pub mod session;
pub mod swap;
pub mod voice;
