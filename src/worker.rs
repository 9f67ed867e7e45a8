//! Worker threads with attached contexts.
//!
//! Every long-running loop in the runtime (receiver, scavenger, acceptor,
//! resolver) runs on a [`Worker`]: an OS thread executing under its own
//! child context so it can be cancelled and joined from the outside.
//! `cancelled` and `deadline_exceeded` escaping the body are the normal
//! shutdown path and are swallowed; other errors are logged.

use crate::context::Context;
use crate::error::{ErrorKind, Result};
use std::thread::JoinHandle;

/// An OS thread running under its own cancellable context.
pub struct Worker {
    ctx: Context,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a worker whose context is a child of the current context.
    ///
    /// # Errors
    ///
    /// `io_error` if the thread or its context cannot be created.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self::spawn_under(Context::current(), name, body)
    }

    /// Spawns a worker whose context hangs off the root context, so it
    /// outlives the spawning scope and is only cancelled explicitly.
    ///
    /// # Errors
    ///
    /// `io_error` if the thread or its context cannot be created.
    pub fn spawn_daemon<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self::spawn_under(Context::top(), name, body)
    }

    fn spawn_under<F>(parent: Context, name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let ctx = parent.child()?;
        let thread_ctx = ctx.clone();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let inner = match thread_ctx.child() {
                    Ok(inner) => inner,
                    Err(e) => {
                        tracing::error!(worker = %thread_name, error = %e, "worker context allocation failed");
                        return;
                    }
                };
                let _scope = inner.enter();
                match body() {
                    Ok(()) => {}
                    Err(e) if matches!(e.kind(), ErrorKind::Cancelled | ErrorKind::DeadlineExceeded) => {
                        tracing::trace!(worker = %thread_name, reason = %e, "worker stopped");
                    }
                    Err(e) => {
                        tracing::warn!(worker = %thread_name, error = %e, "worker failed");
                    }
                }
            })
            .map_err(|e| crate::error::Error::from_io(e, "worker spawn"))?;
        Ok(Self {
            ctx,
            handle: Some(handle),
        })
    }

    /// The worker's context; cancel it to stop the worker.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Returns true once the worker thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, std::thread::JoinHandle::is_finished)
    }

    /// Waits for the worker thread to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.ctx.cancel();
        self.join();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaitable::timeout;
    use crate::select::select;
    use crate::sync::flag::Flag;
    use std::time::Duration;

    #[test]
    fn body_runs_under_its_own_context() {
        let flag = Flag::new().unwrap();
        let seen = flag.clone();
        let mut worker = Worker::spawn("probe", move || {
            assert!(Context::current().deadline().is_none());
            seen.set();
            Ok(())
        })
        .unwrap();
        worker.join();
        assert!(flag.is_set());
    }

    #[test]
    fn cancelling_the_context_stops_a_blocked_worker() {
        let mut worker = Worker::spawn_daemon("sleeper", || {
            let _ = select((timeout(Duration::from_secs(3600)),))?;
            Ok(())
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        worker.context().cancel();
        worker.join();
    }

    #[test]
    fn drop_cancels_and_joins() {
        let worker = Worker::spawn_daemon("sleeper", || {
            let _ = select((timeout(Duration::from_secs(3600)),))?;
            Ok(())
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        drop(worker);
    }
}
