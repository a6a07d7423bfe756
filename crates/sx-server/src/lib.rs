//! sx-server: SSH session multiplexing server
//!
//! Accepts SSH connections, turns every `session` channel into a [`Session`]
//! with a unique id, and processes the channel's requests (`pty-req`,
//! `shell`, `window-change`) so the application sees a byte stream and a
//! queue of terminal resizes. The application plugs in through
//! [`SessionHandler`].

pub mod connection;
pub mod greeter;
pub mod server;
pub mod session;

pub use connection::{ChannelAcceptor, ConnectionSupervisor};
pub use greeter::Greeter;
pub use server::{load_host_key, SshServer};
pub use session::{RequestDispatcher, Session, SessionHandler, SessionRegistry};
