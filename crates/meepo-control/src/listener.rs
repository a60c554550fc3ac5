//! Local accept loop of a source teleportation

use meepo_teleportation::DialRequest;
use std::sync::{Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, Instrument, Span};

/// Owns the accept loop feeding dial requests into a source
///
/// The loop ends on the first accept error, which drops the sender and lets
/// the source close itself. [`ListenerGuard::close`] stops it at most once.
pub(crate) struct ListenerGuard {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerGuard {
    pub(crate) fn spawn(
        listener: TcpListener,
        dial_requests: mpsc::UnboundedSender<DialRequest>,
        span: Span,
    ) -> Self {
        let task = tokio::spawn(
            async move {
                loop {
                    match listener.accept().await {
                        Ok((conn, peer_addr)) => {
                            trace!(%peer_addr, "accepted");
                            if dial_requests.send(DialRequest::new(conn, peer_addr)).is_err() {
                                debug!("source gone, stopping accept loop");
                                return;
                            }
                        }
                        Err(e) => {
                            debug!("failed to accept from listener: {}", e);
                            return;
                        }
                    }
                }
            }
            .instrument(span),
        );
        Self {
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop accepting and release the listen address
    ///
    /// Returns false if the guard was already closed.
    pub(crate) fn close(&self) -> bool {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                task.abort();
                trace!("listener closed");
                true
            }
            None => false,
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_accepted_connections_become_dial_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = ListenerGuard::spawn(listener, tx, Span::none());

        let client = TcpStream::connect(addr).await.unwrap();
        let request = rx.recv().await.unwrap();
        assert_eq!(request.peer_addr(), client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_close_once_releases_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = ListenerGuard::spawn(listener, tx, Span::none());

        assert!(guard.close());
        assert!(!guard.close());

        // Ending the loop drops the sender
        let ended = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(ended, Ok(None)));

        tokio::time::timeout(Duration::from_secs(1), async {
            while TcpListener::bind(addr).await.is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
