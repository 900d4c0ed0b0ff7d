//! Serialization of wallet signature prompts.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Queue for signature prompts.
///
/// A wallet can only show one prompt at a time. Every submission runs its
/// signing step through [`SignerGate::prompt`]; concurrent callers wait in FIFO
/// order (tokio's mutex is fair). Clones share the same queue.
#[derive(Clone, Debug, Default)]
pub struct SignerGate {
    lock: Arc<Mutex<()>>,
}

impl SignerGate {
    /// Create an empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `sign` while holding the gate.
    pub async fn prompt<F, T>(&self, sign: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock.lock().await;
        sign.await
    }

    /// Whether a prompt is currently outstanding.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn prompts_never_overlap() {
        let gate = SignerGate::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                gate.prompt(async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for handle in handles {
            assert!(handle.await.is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!gate.is_busy());
    }
}
