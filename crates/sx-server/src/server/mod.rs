//! SSH server implementation

mod handler;
mod listener;

pub use handler::{ClientHandler, RusshChannelOpen, SshConfig};
pub use listener::{load_host_key, load_or_generate_host_key, SshServer};
