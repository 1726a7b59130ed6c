use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Listener = Box<dyn Fn() + Send>;

/// One-way interruption flag shared between the signal handler, the mode
/// drivers and the worker pool. Listeners are woken when it flips, so
/// waiters never have to poll.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Flip the flag. Only the first call notifies listeners.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("cancellation requested");
        if let Ok(listeners) = self.inner.listeners.lock() {
            for (_, notify) in listeners.iter() {
                notify();
            }
        }
    }

    /// Run `notify` once the token is cancelled, immediately if it already
    /// is. The listener stays registered until the returned guard drops.
    pub fn on_cancel<F>(&self, notify: F) -> Subscription
    where
        F: Fn() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((id, Box::new(notify)));
            // under the lock: a concurrent cancel() may notify twice, never zero times
            if self.is_cancelled() {
                if let Some((_, notify)) = listeners.last() {
                    notify();
                }
            }
        }
        Subscription {
            token: self.clone(),
            id,
        }
    }

    /// Install this token as the process's SIGINT/SIGTERM handler.
    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || token.cancel())?;
        Ok(())
    }
}

pub struct Subscription {
    token: CancelToken,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut listeners) = self.token.inner.listeners.lock() {
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
