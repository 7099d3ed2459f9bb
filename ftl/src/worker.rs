//! Background GC worker abstraction.
//!
//! The core never hard-codes `std::thread`: a `no_std` host drives
//! `Ftl::run_soft_gc`/`Ftl::ioctl(Trim)` from its own scheduler instead of
//! using a [`GcSpawner`] at all. [`StdGcSpawner`] is provided for hosts
//! that do have an OS thread to spare (the crate's own tests included).

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::device::Device;
use crate::Ftl;

/// A running (or joinable) background worker.
pub trait JoinHandle: Send {
    /// Signal shutdown and wait for the worker to stop.
    fn join(self: Box<Self>);
}

/// Launches the background GC worker at `Ftl::open_with_gc`.
pub trait GcSpawner<D: Device + 'static>: Send + Sync {
    fn spawn(&self, ftl: Arc<Ftl<D>>) -> Box<dyn JoinHandle>;
}

#[cfg(any(test, feature = "std"))]
mod std_spawner {
    use super::*;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    /// Runs [`Ftl::run_soft_gc`] on a real OS thread at a fixed interval,
    /// mirroring `pthread_create`/`pthread_join` around the reclaimer in
    /// spirit: one thread launched at open, signaled and joined at close.
    pub struct StdGcSpawner {
        pub poll_interval: Duration,
    }

    impl StdGcSpawner {
        pub fn new(poll_interval: Duration) -> Self {
            StdGcSpawner { poll_interval }
        }
    }

    impl Default for StdGcSpawner {
        fn default() -> Self {
            StdGcSpawner::new(Duration::from_millis(50))
        }
    }

    struct Shutdown {
        stop: Mutex<bool>,
        cvar: Condvar,
    }

    struct StdJoinHandle {
        shutdown: Arc<Shutdown>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl JoinHandle for StdJoinHandle {
        fn join(mut self: Box<Self>) {
            {
                let mut stop = self.shutdown.stop.lock().unwrap();
                *stop = true;
                self.shutdown.cvar.notify_all();
            }
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    impl<D: Device + 'static> GcSpawner<D> for StdGcSpawner {
        fn spawn(&self, ftl: Arc<Ftl<D>>) -> Box<dyn JoinHandle> {
            let shutdown = Arc::new(Shutdown {
                stop: Mutex::new(false),
                cvar: Condvar::new(),
            });
            let worker_shutdown = shutdown.clone();
            let interval = self.poll_interval;
            let thread = std::thread::spawn(move || {
                let mut stop = worker_shutdown.stop.lock().unwrap();
                loop {
                    if *stop {
                        break;
                    }
                    let (guard, _timeout) = worker_shutdown.cvar.wait_timeout(stop, interval).unwrap();
                    stop = guard;
                    if *stop {
                        break;
                    }
                    ftl.run_soft_gc();
                }
            });
            Box::new(StdJoinHandle {
                shutdown,
                thread: Some(thread),
            })
        }
    }
}

#[cfg(any(test, feature = "std"))]
pub use std_spawner::StdGcSpawner;
