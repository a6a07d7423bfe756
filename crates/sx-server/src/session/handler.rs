//! Application session handler

use std::future::Future;

use async_trait::async_trait;

use super::Session;

/// Application code run once per accepted session
///
/// The handler owns the session's I/O. It should also consume
/// [`Session::next_resize`], otherwise resize events back up and are
/// eventually dropped.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Serve one session
    async fn handle(&self, session: Session);
}

#[async_trait]
impl<F, Fut> SessionHandler for F
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, session: Session) {
        (self)(session).await
    }
}
