use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub type TombResult = std::result::Result<(), Arc<anyhow::Error>>;

/// Supervises a group of background tasks.
///
/// `kill` raises the dying signal, `wait` joins every task spawned with `go`.
/// The first error returned by any task is kept and handed back by every
/// subsequent `wait`. A task error also kills the tomb.
#[derive(Clone, Default)]
pub struct Tomb {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    token: CancellationToken,
    tracker: TaskTracker,
    err: Mutex<Option<Arc<anyhow::Error>>>,
}

impl Tomb {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `fut` on the current tokio runtime under this tomb.
    pub fn go<F>(&self, fut: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.alive() {
            return Err(anyhow!("tomb is dying, task not started"));
        }
        let tomb = self.clone();
        self.inner.tracker.spawn(async move {
            if let Err(e) = fut.await {
                tomb.kill_with(e);
            }
        });
        Ok(())
    }

    /// Raises the dying signal. Safe to call any number of times.
    #[inline]
    pub fn kill(&self) {
        self.inner.token.cancel();
        self.inner.tracker.close();
    }

    /// Records `err` if no error has been recorded yet, then kills.
    pub fn kill_with(&self, err: anyhow::Error) {
        {
            let mut slot = self.inner.err.lock();
            if slot.is_none() {
                *slot = Some(Arc::new(err));
            }
        }
        self.kill();
    }

    #[inline]
    pub fn alive(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    /// Resolves once the tomb starts dying.
    #[inline]
    pub async fn dying(&self) {
        self.inner.token.cancelled().await
    }

    #[inline]
    pub fn err(&self) -> Option<Arc<anyhow::Error>> {
        self.inner.err.lock().clone()
    }

    /// Waits for every spawned task to return.
    pub async fn wait(&self) -> TombResult {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.tracker.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.tracker.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn kill_and_wait() {
        let tomb = Tomb::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let t = tomb.clone();
            let stopped = stopped.clone();
            tomb.go(async move {
                t.dying().await;
                stopped.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        assert!(tomb.alive());
        tomb.kill();
        tomb.kill();
        assert!(!tomb.alive());
        assert!(tomb.wait().await.is_ok());
        assert!(tomb.wait().await.is_ok());
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
        assert!(tomb.go(async { Ok(()) }).is_err());
    }

    #[tokio::test]
    async fn first_error_is_kept() {
        let tomb = Tomb::new();
        tomb.go(async { Err(anyhow!("first")) }).unwrap();
        tomb.dying().await;
        tomb.kill_with(anyhow!("second"));
        let e1 = tomb.wait().await.unwrap_err();
        let e2 = tomb.wait().await.unwrap_err();
        assert_eq!(e1.to_string(), "first");
        assert_eq!(e2.to_string(), "first");
    }

    #[tokio::test]
    async fn wait_without_tasks() {
        let tomb = Tomb::new();
        let res = tokio::time::timeout(Duration::from_secs(1), tomb.wait()).await;
        assert!(matches!(res, Ok(Ok(()))));
        tomb.kill();
        tokio::time::timeout(Duration::from_secs(1), tomb.dying()).await.unwrap();
    }
}
