//! actix-ws connection handling: one task per socket, dispatching decoded
//! wire messages into the `engine` handlers.

pub mod instance;
