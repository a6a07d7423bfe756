//! Client sessions
//!
//! One `Session` is created per accepted `session` channel. Its requests are
//! processed by a `RequestDispatcher` while a `SessionHandler` serves its I/O.

mod client;
mod dispatcher;
mod handler;
mod registry;

pub use client::Session;
pub use dispatcher::RequestDispatcher;
pub use handler::SessionHandler;
pub use registry::SessionRegistry;
