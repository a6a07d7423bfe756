//! Demo session handler
//!
//! Greets each client with its session id, reports every terminal resize,
//! and hangs up when the client types Ctrl-C or Ctrl-D.

use async_trait::async_trait;

use crate::session::{Session, SessionHandler};

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;

/// Greets clients and echoes their terminal size
#[derive(Debug, Default, Clone, Copy)]
pub struct Greeter;

#[async_trait]
impl SessionHandler for Greeter {
    async fn handle(&self, session: Session) {
        let welcome = format!("welcome, id: {}\n\r", session.id());
        if session.write(welcome.as_bytes()).await.is_err() {
            return;
        }

        let reporter = session.clone();
        let resizes = tokio::spawn(async move {
            while let Some(size) = reporter.next_resize().await {
                let line = format!("resize to {} x {}\n\r", size.width, size.height);
                if reporter.write(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = [0u8; 64];
        loop {
            match session.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) if is_hangup(&buf[..n]) => {
                    if let Err(e) = session.disconnect().await {
                        tracing::debug!("Hang-up for {} failed: {}", session.id(), e);
                    }
                    break;
                }
                Ok(_) => {}
            }
        }

        resizes.abort();
    }
}

fn is_hangup(input: &[u8]) -> bool {
    input.iter().any(|&b| b == CTRL_C || b == CTRL_D)
}
