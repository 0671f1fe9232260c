//! Request/response correlation over the shared socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::ClientError;
use crate::frame::{Frame, Request, Response};
use crate::handlers::Subscription;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `timeout` from now, saturating for huge values such as `Duration::MAX`.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Removes a call's response handler when the call ends, including when the
/// caller drops the call future before it resolves.
struct CallGuard {
    subscription: Option<Arc<Subscription>>,
}

impl CallGuard {
    fn new(subscription: Subscription) -> Self {
        Self {
            subscription: Some(Arc::new(subscription)),
        }
    }

    async fn release(mut self) {
        if let Some(subscription) = self.subscription.clone() {
            subscription.remove().await;
        }
        self.subscription = None;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    subscription.remove().await;
                });
            }
            Err(_) => warn!(key = %subscription.key(), "no runtime to remove abandoned call handler"),
        }
    }
}

impl Connection {
    /// Send `request` and wait for the response carrying its `request_id`.
    ///
    /// The deadline runs from invocation and covers dialing and sending.
    /// `None` uses the configured request timeout. The response handler is
    /// removed on every exit path.
    pub async fn call(
        self: &Arc<Self>,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        let deadline =
            deadline_after(timeout.unwrap_or_else(|| self.config().request_timeout()));
        let request_id = request.request_id.clone();
        let method = request.method.clone();

        let (result_tx, mut result_rx) = mpsc::channel::<Response>(1);
        let subscription = {
            let request_id = request_id.clone();
            self.handlers()
                .add(&method, move |frame: Arc<Frame>| {
                    let result_tx = result_tx.clone();
                    let request_id = request_id.clone();
                    async move {
                        if let Some(response) = frame.as_response() {
                            if response.request_id == request_id {
                                // single slot; a duplicate reply is dropped
                                let _ = result_tx.try_send(response.clone());
                            }
                        }
                    }
                })
                .await
        };
        let guard = CallGuard::new(subscription);

        let (error_tx, mut error_rx) = mpsc::channel::<ClientError>(1);
        if !self.is_listening() {
            let connection = self.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.listen().await {
                    let _ = error_tx.send(e).await;
                }
            });
        }

        debug!(request_id = %request_id, method = %method, "sending request");
        let outcome = tokio::time::timeout_at(deadline, async {
            self.send(&Frame::request(request)).await?;
            tokio::select! {
                Some(response) = result_rx.recv() => Ok(response),
                Some(e) = error_rx.recv() => Err(e),
                else => Err(ClientError::NotConnected),
            }
        })
        .await;

        guard.release().await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id = %request_id, method = %method, "request timed out");
                Err(ClientError::TimedOut)
            }
        }
    }
}
