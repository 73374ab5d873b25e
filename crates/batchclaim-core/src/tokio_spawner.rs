//! Tokio-based task spawner.
//!
//! A panicking producer or monitor is logged instead of taking the caller
//! down with it.
use pin_project_lite::pin_project;

use crate::spawner::TaskSpawner;

/// Spawn loops onto the Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

pin_project! {
    /// Wrap Tokio's `JoinHandle<()>` and log panics instead of bubbling them.
    pub struct TokioTaskHandle {
        #[pin]
        handle: tokio::task::JoinHandle<()>
    }
}

impl TokioTaskHandle {
    /// Cancel the task at its next suspension point. Prefer a shutdown
    /// signal, which lets the producer release undelivered records.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Future for TokioTaskHandle {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();
        match this.handle.poll(cx) {
            std::task::Poll::Ready(result) => {
                if let Err(error) = result {
                    tracing::error!(error = %error, "background task failed");
                };
                std::task::Poll::Ready(())
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl TaskSpawner for TokioSpawner {
    type TaskHandle<Fut>
        = TokioTaskHandle
    where
        Fut: Future<Output = ()> + Send + 'static;

    fn spawn<Fut>(fut: Fut) -> Self::TaskHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        TokioTaskHandle {
            handle: tokio::spawn(fut),
        }
    }
}
