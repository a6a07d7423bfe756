//! Channel acceptance for a single connection

mod acceptor;
pub mod memory;
mod supervisor;

pub use acceptor::ChannelAcceptor;
pub use supervisor::{discard_requests, ConnectionSupervisor};

use futures::Stream;
use tokio::sync::mpsc;

use sx_core::traits::RejectReason;

/// How the server answered a channel open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Channel accepted
    Accepted,
    /// Channel rejected
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

/// Adapt an mpsc receiver into a stream
pub fn receiver_stream<T: Send + 'static>(
    rx: mpsc::Receiver<T>,
) -> impl Stream<Item = T> + Send + Unpin {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}
