//! sx-protocol: Channel request payloads for shellmux
//!
//! This crate defines the binary payloads carried by SSH session channel
//! requests (`pty-req`, `window-change`, ...) and the typed request/reply
//! envelope the server uses to answer them.

pub mod dimensions;
pub mod error;
pub mod request;
pub mod session;

pub use dimensions::{window_change_payload, PtyRequest, ScreenSize, DIMENSION_RECORD_SIZE};
pub use error::ProtocolError;
pub use request::{put_string, ControlRequest, Reply, RequestKind};
pub use session::SessionId;
