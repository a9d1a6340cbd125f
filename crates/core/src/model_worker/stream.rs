//! Streaming predictions
//!
//! A [`TokenStream`] is a pull-based view over a bounded queue. A producer
//! task forwards chunks from the worker into the queue while holding the
//! handle's busy guard, and releases the guard before closing the queue.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::handle::BusyGuard;
use crate::{Error, Result};

/// Lazy, finite, non-restartable sequence of partial completions
///
/// Dropping the stream cancels production: the producer stops forwarding,
/// the worker call is abandoned and the handle becomes available to the next
/// caller. The worker itself may keep generating until it notices.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String>>,
}

impl TokenStream {
    pub(crate) fn spawn(
        upstream: BoxStream<'static, Result<String>>,
        guard: BusyGuard,
        buffer: usize,
        deadline: Option<Duration>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let expires = deadline.map(|d| (Instant::now() + d, d));

        tokio::spawn(async move {
            let mut upstream = upstream;
            let mut timed_out = None;

            let pump = async {
                while let Some(item) = upstream.next().await {
                    let failed = item.is_err();
                    if let Err(Error::ConnectionLost(_)) = &item {
                        guard.fail();
                    }
                    if tx.send(item).await.is_err() || failed {
                        return;
                    }
                }
            };

            let expiry = async {
                match expires {
                    Some((at, _)) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = pump => {}
                _ = tx.closed() => {
                    tracing::debug!(worker = %guard.key(), "Stream consumer went away");
                }
                _ = expiry => {
                    timed_out = expires.map(|(_, d)| d);
                }
            }

            if let Some(d) = timed_out {
                tracing::warn!(worker = %guard.key(), "Stream deadline of {:?} expired", d);
            }

            // Release the handle before the consumer can observe the end.
            // A consumer that stopped polling must not keep it locked.
            drop(upstream);
            drop(guard);
            if let Some(d) = timed_out {
                let _ = tx.send(Err(Error::Timeout(d))).await;
            }
            drop(tx);
        });

        Self { rx }
    }

    /// Consume the whole stream into one string
    pub async fn into_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.rx.recv().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }

    /// Stop production without waiting for the remaining chunks
    pub fn cancel(&mut self) {
        self.rx.close();
    }
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
