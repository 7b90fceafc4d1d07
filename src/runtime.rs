//! Runtime abstraction layer for async operations
//!
//! This module provides runtime-agnostic interfaces for async operations so
//! tile fetches can run on Tokio when available. With the `tokio-runtime`
//! feature, spawns from outside a Tokio context go to a lazily built
//! background runtime, so Tokio-based fetchers such as reqwest still have a
//! reactor. Without the feature, futures run on plain worker threads. Every
//! spawn returns an [`AsyncHandle`], which is what a
//! [`TileEntity`](crate::TileEntity) keeps as cancellable owned work.

use crate::prelude::{Arc, Future, Pin};
use std::sync::atomic::{AtomicBool, Ordering};

/// A trait for spawning async tasks (object-safe version)
pub trait AsyncSpawner: Send + Sync + 'static {
    /// Spawn a future and return a handle to it
    fn spawn_boxed(
        &self,
        future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn AsyncHandle>;
}

/// Handle to a spawned async task
pub trait AsyncHandle: Send + Sync {
    /// Check if the task is finished
    fn is_finished(&self) -> bool;

    /// Cancel the task
    fn cancel(&self);
}

/// Convenience function for spawning on the global runtime
pub fn spawn<F>(future: F) -> Box<dyn AsyncHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    runtime().spawn_boxed(Box::pin(future))
}

/// Default spawner implementations
pub mod spawners {
    use super::*;

    #[cfg(feature = "tokio-runtime")]
    pub mod tokio_impl {
        use super::*;
        use ::tokio::runtime::{Builder, Handle, Runtime};
        use ::tokio::task::JoinHandle;
        use once_cell::sync::Lazy;

        /// Runtime for spawns made outside any Tokio context
        static BACKGROUND_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
            match Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("terraplet-io")
                .enable_all()
                .build()
            {
                Ok(runtime) => Some(runtime),
                Err(e) => {
                    log::error!("failed to build background tokio runtime: {}", e);
                    None
                }
            }
        });

        /// Tokio-based async spawner
        pub struct TokioSpawner;

        impl AsyncSpawner for TokioSpawner {
            fn spawn_boxed(
                &self,
                future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
            ) -> Box<dyn AsyncHandle> {
                if let Ok(handle) = Handle::try_current() {
                    return Box::new(TokioHandle(handle.spawn(future)));
                }
                match BACKGROUND_RUNTIME.as_ref() {
                    Some(runtime) => Box::new(TokioHandle(runtime.spawn(future))),
                    None => ThreadSpawner.spawn_boxed(future),
                }
            }
        }

        struct TokioHandle(JoinHandle<()>);

        impl AsyncHandle for TokioHandle {
            fn is_finished(&self) -> bool {
                self.0.is_finished()
            }

            fn cancel(&self) {
                self.0.abort();
            }
        }
    }

    /// Runs each future to completion on its own OS thread.
    pub struct ThreadSpawner;

    impl AsyncSpawner for ThreadSpawner {
        fn spawn_boxed(
            &self,
            future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
        ) -> Box<dyn AsyncHandle> {
            let (future, abort) = futures::future::abortable(future);
            let finished = Arc::new(AtomicBool::new(false));
            let finished_clone = finished.clone();

            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    futures::executor::block_on(future)
                }));
                if result.is_err() {
                    log::error!("spawned task panicked");
                }
                finished_clone.store(true, Ordering::Release);
            });

            Box::new(ThreadHandle { abort, finished })
        }
    }

    struct ThreadHandle {
        abort: futures::future::AbortHandle,
        finished: Arc<AtomicBool>,
    }

    impl AsyncHandle for ThreadHandle {
        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::Acquire)
        }

        fn cancel(&self) {
            self.abort.abort();
        }
    }

    /// Handle backed by two flags. Also usable directly as a manual work
    /// handle, e.g. for requests tracked outside the runtime.
    #[derive(Debug, Clone, Default)]
    pub struct CancelFlagHandle {
        cancelled: Arc<AtomicBool>,
        finished: Arc<AtomicBool>,
    }

    impl CancelFlagHandle {
        pub fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::Acquire)
        }

        pub fn mark_finished(&self) {
            self.finished.store(true, Ordering::Release);
        }
    }

    impl AsyncHandle for CancelFlagHandle {
        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::Acquire)
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::Release);
        }
    }
}

/// Unified async utilities
pub mod async_utils {
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::task::{Poll, Waker};

    #[derive(Debug)]
    struct SemaphoreState {
        permits: usize,
        waiters: Vec<Waker>,
    }

    /// Counting semaphore shared between the loader and its spawned fetches.
    /// Waiting tasks park on their waker and are woken by `release`.
    #[derive(Debug, Clone)]
    pub struct Semaphore {
        state: Arc<Mutex<SemaphoreState>>,
        max_permits: usize,
    }

    impl Semaphore {
        pub fn new(permits: usize) -> Self {
            Self {
                state: Arc::new(Mutex::new(SemaphoreState {
                    permits,
                    waiters: Vec::new(),
                })),
                max_permits: permits,
            }
        }

        fn state(&self) -> MutexGuard<'_, SemaphoreState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn try_acquire(&self) -> bool {
            let mut state = self.state();
            if state.permits > 0 {
                state.permits -= 1;
                true
            } else {
                false
            }
        }

        /// Waits until a permit is available
        pub async fn acquire(&self) {
            futures::future::poll_fn(|cx| {
                let mut state = self.state();
                if state.permits > 0 {
                    state.permits -= 1;
                    Poll::Ready(())
                } else {
                    state.waiters.push(cx.waker().clone());
                    Poll::Pending
                }
            })
            .await
        }

        pub fn release(&self) {
            let waiters = {
                let mut state = self.state();
                if state.permits < self.max_permits {
                    state.permits += 1;
                }
                std::mem::take(&mut state.waiters)
            };
            // Every waiter retries; those that lose the race park again
            for waker in waiters {
                waker.wake();
            }
        }

        pub fn available_permits(&self) -> usize {
            self.state().permits
        }

        /// Tasks currently parked in `acquire`
        pub fn waiting(&self) -> usize {
            self.state().waiters.len()
        }
    }

    /// Releases its permit when dropped, including when the owning task is aborted.
    pub struct SemaphorePermit(Semaphore);

    impl SemaphorePermit {
        pub async fn acquire(semaphore: &Semaphore) -> Self {
            semaphore.acquire().await;
            Self(semaphore.clone())
        }
    }

    impl Drop for SemaphorePermit {
        fn drop(&mut self) {
            self.0.release();
        }
    }

    /// Unified async delay function that works across runtimes
    pub async fn async_delay(duration: std::time::Duration) {
        #[cfg(feature = "tokio-runtime")]
        {
            if ::tokio::runtime::Handle::try_current().is_ok() {
                ::tokio::time::sleep(duration).await;
                return;
            }
        }

        let (tx, rx) = futures::channel::oneshot::channel::<()>();
        std::thread::spawn(move || {
            std::thread::sleep(duration);
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

/// Global runtime instance
static RUNTIME: std::sync::OnceLock<Box<dyn AsyncSpawner>> = std::sync::OnceLock::new();

/// Initialize the runtime with a specific spawner
pub fn init_runtime(spawner: Box<dyn AsyncSpawner>) {
    if RUNTIME.set(spawner).is_err() {
        log::debug!("runtime already initialized, keeping existing spawner");
    }
}

/// Get the global runtime spawner
pub fn runtime() -> &'static dyn AsyncSpawner {
    RUNTIME
        .get_or_init(|| {
            #[cfg(feature = "tokio-runtime")]
            {
                Box::new(spawners::tokio_impl::TokioSpawner)
            }

            #[cfg(not(feature = "tokio-runtime"))]
            {
                Box::new(spawners::ThreadSpawner)
            }
        })
        .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::Duration;

    #[test]
    fn test_semaphore_permits() {
        let semaphore = async_utils::Semaphore::new(2);
        assert!(semaphore.try_acquire());
        assert!(semaphore.try_acquire());
        assert!(!semaphore.try_acquire());
        semaphore.release();
        assert_eq!(semaphore.available_permits(), 1);
        semaphore.release();
        semaphore.release();
        assert_eq!(semaphore.available_permits(), 2);
    }

    #[test]
    fn test_permit_released_on_drop() {
        let semaphore = async_utils::Semaphore::new(1);
        let permit = futures::executor::block_on(async_utils::SemaphorePermit::acquire(&semaphore));
        assert_eq!(semaphore.available_permits(), 0);
        drop(permit);
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn test_parked_acquire_woken_by_release() {
        let semaphore = async_utils::Semaphore::new(1);
        assert!(semaphore.try_acquire());

        let (tx, rx) = crossbeam_channel::bounded(1);
        let waiter = semaphore.clone();
        std::thread::spawn(move || {
            futures::executor::block_on(waiter.acquire());
            let _ = tx.send(());
        });

        let start = std::time::Instant::now();
        while semaphore.waiting() == 0 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(semaphore.waiting(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        semaphore.release();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(semaphore.available_permits(), 0);
        assert_eq!(semaphore.waiting(), 0);
    }

    #[cfg(feature = "tokio-runtime")]
    #[test]
    fn test_tokio_spawner_outside_tokio_context() {
        assert!(::tokio::runtime::Handle::try_current().is_err());

        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = spawners::tokio_impl::TokioSpawner.spawn_boxed(Box::pin(async move {
            // Needs a Tokio timer driver
            ::tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(());
        }));

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        let start = std::time::Instant::now();
        while !handle.is_finished() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_finished());
    }

    #[test]
    fn test_thread_spawner_cancel() {
        let spawner = spawners::ThreadSpawner;
        let handle = spawner.spawn_boxed(Box::pin(async {
            async_utils::async_delay(Duration::from_secs(30)).await;
        }));
        assert!(!handle.is_finished());
        handle.cancel();

        let start = std::time::Instant::now();
        while !handle.is_finished() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_finished());
    }

    #[cfg(feature = "tokio-runtime")]
    #[::tokio::test]
    async fn test_tokio_spawner() {
        let handle = spawners::tokio_impl::TokioSpawner.spawn_boxed(Box::pin(async {
            ::tokio::time::sleep(::tokio::time::Duration::from_millis(10)).await;
        }));

        // Should not be finished immediately
        assert!(!handle.is_finished());

        ::tokio::time::sleep(::tokio::time::Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }
}
