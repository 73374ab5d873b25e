//! How long-running loops are executed (inline, Tokio, etc.).

/// Turns a loop future into something the caller can await or detach.
pub trait TaskSpawner {
    type TaskHandle<Fut>: Future<Output = ()> + Send + 'static
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::TaskHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static;
}

/// Hands the future back untouched; it runs wherever the caller awaits it.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineSpawner;

impl TaskSpawner for InlineSpawner {
    type TaskHandle<Fut>
        = Fut
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::TaskHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        fut
    }
}
