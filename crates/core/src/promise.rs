//! Single-result broadcast: computed at most once, awaited by many.

use tokio::sync::watch;

/// A one-shot result slot with any number of waiters.
///
/// Exactly one `resolve`/`reject`/`settle` call takes effect; later calls
/// return `false` and leave the stored result untouched.
#[derive(Debug)]
pub struct Promise<T, E> {
    tx: watch::Sender<Option<Result<T, E>>>,
}

impl<T: Clone, E: Clone> Promise<T, E> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn resolve(&self, value: T) -> bool { self.settle(Ok(value)) }

    pub fn reject(&self, error: E) -> bool { self.settle(Err(error)) }

    /// Store `result` unless already settled. Returns whether this call won.
    pub fn settle(&self, result: Result<T, E>) -> bool {
        let mut pending = Some(result);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = pending.take();
            true
        })
    }

    pub fn is_settled(&self) -> bool { self.tx.borrow().is_some() }

    /// Current result without waiting.
    pub fn peek(&self) -> Option<Result<T, E>> { self.tx.borrow().as_ref().cloned() }

    /// Wait until settled and return a clone of the result.
    pub async fn wait(&self) -> Result<T, E> {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().as_ref().cloned();
            if let Some(settled) = current {
                return settled;
            }
            // `self` owns the sender, so the channel cannot close under us.
            let _ = rx.changed().await;
        }
    }
}

impl<T: Clone, E: Clone> Default for Promise<T, E> {
    fn default() -> Self { Self::new() }
}
