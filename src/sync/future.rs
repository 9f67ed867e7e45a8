//! Select-friendly single-shot futures and promises.
//!
//! [`pair`] creates a rendezvous for exactly one value: the [`Promise`]
//! half is fulfilled at most once (enforced by move: `set_value` and
//! `set_error` consume it), the [`Future`] half exposes a blocking `get`
//! and an awaitable `async_get`. Dropping a promise without fulfilling it
//! breaks the future with `invalid_state`.
//!
//! The consumer side composes like an awaitable: [`then`](Future::then)
//! pipes the delivered value and [`except`](Future::except) intercepts one
//! error kind.

use crate::awaitable::{Awaitable, Trigger};
use crate::error::{Error, ErrorKind, Result};
use crate::sync::flag::Flag;
use parking_lot::Mutex;
use std::sync::Arc;

struct FutureCell<T> {
    result: Option<Result<T>>,
    fulfilled: bool,
}

struct FutureShared<T> {
    cell: Mutex<FutureCell<T>>,
    ready: Flag,
}

impl<T> FutureShared<T> {
    fn fulfill(&self, result: Result<T>) {
        let mut cell = self.cell.lock();
        debug_assert!(!cell.fulfilled, "promise fulfilled twice");
        if cell.fulfilled {
            return;
        }
        cell.result = Some(result);
        cell.fulfilled = true;
        self.ready.set();
    }

    fn maybe_take(&self) -> Result<T> {
        let mut cell = self.cell.lock();
        if let Some(result) = cell.result.take() {
            self.ready.reset();
            return result;
        }
        if cell.fulfilled {
            Err(Error::invalid_state("future value already taken"))
        } else {
            Err(Error::try_again("future not ready yet"))
        }
    }
}

/// The producing half of a future/promise pair.
pub struct Promise<T> {
    shared: Arc<FutureShared<T>>,
}

impl<T> Promise<T> {
    /// Delivers the value. Consumes the promise.
    pub fn set_value(self, value: T) {
        self.shared.fulfill(Ok(value));
    }

    /// Delivers an error. Consumes the promise.
    pub fn set_error(self, error: Error) {
        self.shared.fulfill(Err(error));
    }

    /// Delivers a ready result. Consumes the promise.
    pub fn set_result(self, result: Result<T>) {
        self.shared.fulfill(result);
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // An abandoned promise must still wake its future.
        let mut cell = self.shared.cell.lock();
        if !cell.fulfilled {
            cell.result = Some(Err(Error::invalid_state("broken promise")));
            cell.fulfilled = true;
            self.shared.ready.set();
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

type GetFn<T> = Box<dyn FnMut() -> Result<T> + Send>;

/// The consuming half of a future/promise pair.
pub struct Future<T> {
    ready: Flag,
    get_fn: GetFn<T>,
}

impl<T: Send + 'static> Future<T> {
    /// Takes the value if it has been delivered.
    ///
    /// # Errors
    ///
    /// `try_again` before delivery, `invalid_state` after the value was
    /// already taken, or the delivered error.
    pub fn maybe_get(&mut self) -> Result<T> {
        (self.get_fn)()
    }

    /// An awaitable that fires while a value is waiting to be taken.
    #[must_use]
    pub fn can_get(&self) -> Awaitable<'static, ()> {
        self.ready.async_wait()
    }

    /// An awaitable that takes the value once delivered.
    #[must_use]
    pub fn async_get(&mut self) -> Awaitable<'_, T> {
        let fd = self.ready.fd();
        let get_fn = &mut self.get_fn;
        Awaitable::new(Trigger::Readable(fd), move || get_fn())
    }

    /// Blocks until the value is delivered and takes it.
    ///
    /// # Errors
    ///
    /// The delivered error, or `cancelled` / `deadline_exceeded` from the
    /// current context.
    pub fn get(&mut self) -> Result<T> {
        let (value,) = crate::select::select((self.async_get(),))?;
        value.ok_or_else(|| Error::internal("select returned without a future value"))
    }

    /// Pipes the delivered value through `f`.
    #[must_use]
    pub fn then<U, F>(self, f: F) -> Future<U>
    where
        F: FnOnce(T) -> Result<U> + Send + 'static,
        U: Send + 'static,
    {
        let mut get_fn = self.get_fn;
        let mut f = Some(f);
        Future {
            ready: self.ready,
            get_fn: Box::new(move || {
                let value = get_fn()?;
                let f = f
                    .take()
                    .ok_or_else(|| Error::invalid_state("future continuation already ran"))?;
                f(value)
            }),
        }
    }

    /// Installs a handler for a delivered error of kind `kind`.
    #[must_use]
    pub fn except<F>(self, kind: ErrorKind, f: F) -> Future<T>
    where
        F: FnOnce(Error) -> Result<T> + Send + 'static,
    {
        let mut get_fn = self.get_fn;
        let mut f = Some(f);
        Future {
            ready: self.ready,
            get_fn: Box::new(move || match get_fn() {
                Err(e) if e.kind() == kind => {
                    let f = f
                        .take()
                        .ok_or_else(|| Error::invalid_state("future handler already ran"))?;
                    f(e)
                }
                other => other,
            }),
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.ready.is_set())
            .finish_non_exhaustive()
    }
}

/// Creates a connected promise/future pair.
///
/// # Errors
///
/// Fails if the readiness descriptor cannot be allocated.
pub fn pair<T: Send + 'static>() -> Result<(Promise<T>, Future<T>)> {
    let shared = Arc::new(FutureShared {
        cell: Mutex::new(FutureCell {
            result: None,
            fulfilled: false,
        }),
        ready: Flag::new()?,
    });
    let promise = Promise {
        shared: Arc::clone(&shared),
    };
    let taker = Arc::clone(&shared);
    let future = Future {
        ready: shared.ready.clone(),
        get_fn: Box::new(move || taker.maybe_take()),
    };
    Ok((promise, future))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::select;
    use std::time::Duration;

    #[test]
    fn value_is_delivered_once() {
        let (promise, mut future) = pair::<u32>().unwrap();
        promise.set_value(17);
        assert_eq!(future.maybe_get().unwrap(), 17);
        assert_eq!(
            future.maybe_get().unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn not_ready_is_try_again() {
        let (_promise, mut future) = pair::<u32>().unwrap();
        assert!(future.maybe_get().unwrap_err().is_try_again());
    }

    #[test]
    fn delivered_error_is_rethrown() {
        let (promise, mut future) = pair::<u32>().unwrap();
        promise.set_error(Error::not_found("no such method"));
        assert_eq!(future.get().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn abandoned_promise_breaks_the_future() {
        let (promise, mut future) = pair::<u32>().unwrap();
        drop(promise);
        let err = future.get().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.message(), "broken promise");
    }

    #[test]
    fn get_blocks_until_another_thread_delivers() {
        let (promise, mut future) = pair::<String>().unwrap();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            promise.set_value("late".into());
        });
        assert_eq!(future.get().unwrap(), "late");
        handle.join().unwrap();
    }

    #[test]
    fn async_get_in_select_with_timer() {
        let (promise, mut future) = pair::<u8>().unwrap();
        promise.set_value(3);
        let (value, timer) = select((
            future.async_get(),
            crate::awaitable::timeout(Duration::from_secs(5)),
        ))
        .unwrap();
        assert_eq!(value, Some(3));
        assert_eq!(timer, None);
    }

    #[test]
    fn then_transforms_the_value() {
        let (promise, future) = pair::<u32>().unwrap();
        promise.set_value(21);
        let mut doubled = future.then(|v| Ok(v * 2));
        assert_eq!(doubled.get().unwrap(), 42);
    }

    #[test]
    fn then_failures_surface() {
        let (promise, future) = pair::<u32>().unwrap();
        promise.set_value(21);
        let mut failing =
            future.then(|_| -> Result<u32> { Err(Error::data_mismatch("bad payload")) });
        assert_eq!(failing.get().unwrap_err().kind(), ErrorKind::DataMismatch);
    }

    #[test]
    fn except_intercepts_matching_kind() {
        let (promise, future) = pair::<u32>().unwrap();
        promise.set_error(Error::eof("closed"));
        let mut recovered = future.except(ErrorKind::Eof, |_| Ok(0));
        assert_eq!(recovered.get().unwrap(), 0);
    }
}
