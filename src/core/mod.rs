//! The shared connection-lifecycle engine: the bidirectional pump
//! (C2), the listener/registry (C5), and the server supervisor (C6).

pub mod listener;
pub mod pump;
pub mod supervisor;

pub use listener::{ConnectionHandler, Listener, ManagedListener, NegotiatedSession, SessionHandle};
pub use pump::CloseGuard;
pub use supervisor::Supervisor;
