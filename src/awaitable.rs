//! The awaitable primitive.
//!
//! An [`Awaitable`] is a *description* of a single wait condition, not a
//! running task: one trigger (fd readiness, timer, polling interval, never,
//! always) paired with a reaction function that runs on the waking thread
//! when the trigger fires. Reactions must be non-blocking and run to
//! completion synchronously inside [`select`](crate::select::select).
//!
//! Reactions compose: [`then`](Awaitable::then) pipes the result,
//! [`except`](Awaitable::except) installs a handler for one error kind, and
//! [`decorate`](Awaitable::decorate) wraps the whole reaction.
//!
//! A reaction that returns [`ErrorKind::TryAgain`](crate::ErrorKind)
//! declares the wake spurious: the awaitable is treated as not having fired
//! and the enclosing `select` keeps waiting. Flags and queues use this to
//! absorb lost races, and polling triggers use it to re-check a condition
//! without terminating the wait.

use crate::error::{Error, ErrorKind, Result};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// What wakes an awaitable. Exactly one trigger, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fire when the file descriptor becomes readable.
    Readable(RawFd),
    /// Fire when the file descriptor becomes writable.
    Writable(RawFd),
    /// Fire once, the given duration after the wait starts.
    Timeout(Duration),
    /// Fire repeatedly at the given interval until the wait finishes.
    Polling(Duration),
    /// Never fire. Contributes neither an fd nor a timeout to the wait.
    Never,
    /// Fire immediately, without waiting.
    Always,
}

type ReactFn<'a, R> = Box<dyn FnMut() -> Result<R> + Send + 'a>;

/// A single wait trigger plus a reaction producing `R` when it fires.
pub struct Awaitable<'a, R> {
    trigger: Trigger,
    react: ReactFn<'a, R>,
}

impl<'a, R> Awaitable<'a, R> {
    /// Creates an awaitable from a trigger and a reaction function.
    pub fn new(trigger: Trigger, react: impl FnMut() -> Result<R> + Send + 'a) -> Self {
        Self {
            trigger,
            react: Box::new(react),
        }
    }

    /// Returns the trigger.
    #[must_use]
    pub const fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Runs the reaction. Called by `select` when the trigger fires.
    pub(crate) fn react(&mut self) -> Result<R> {
        (self.react)()
    }

    /// Pipes the reaction result through `f`.
    pub fn then<R2, F>(self, mut f: F) -> Awaitable<'a, R2>
    where
        F: FnMut(R) -> R2 + Send + 'a,
        R: 'a,
    {
        let mut react = self.react;
        Awaitable {
            trigger: self.trigger,
            react: Box::new(move || Ok(f(react()?))),
        }
    }

    /// Pipes the reaction result through a fallible `f`.
    pub fn and_then<R2, F>(self, mut f: F) -> Awaitable<'a, R2>
    where
        F: FnMut(R) -> Result<R2> + Send + 'a,
        R: 'a,
    {
        let mut react = self.react;
        Awaitable {
            trigger: self.trigger,
            react: Box::new(move || f(react()?)),
        }
    }

    /// Installs a handler for reactions failing with `kind`.
    ///
    /// Handlers are consulted innermost-first when chained; errors of other
    /// kinds pass through untouched.
    pub fn except<F>(self, mut handler: F) -> Awaitable<'a, R>
    where
        F: FnMut(Error) -> Result<R> + Send + 'a,
        R: 'a,
    {
        self.except_kind_impl(None, move |e| handler(e))
    }

    /// Installs a handler for reactions failing with exactly `kind`.
    pub fn except_kind<F>(self, kind: ErrorKind, handler: F) -> Awaitable<'a, R>
    where
        F: FnMut(Error) -> Result<R> + Send + 'a,
        R: 'a,
    {
        self.except_kind_impl(Some(kind), handler)
    }

    fn except_kind_impl<F>(self, kind: Option<ErrorKind>, mut handler: F) -> Awaitable<'a, R>
    where
        F: FnMut(Error) -> Result<R> + Send + 'a,
        R: 'a,
    {
        let mut react = self.react;
        Awaitable {
            trigger: self.trigger,
            react: Box::new(move || match react() {
                Err(e) if kind.is_none() || kind == Some(e.kind()) => handler(e),
                other => other,
            }),
        }
    }

    /// Wraps the whole reaction: `f` receives the inner reaction and
    /// decides when (or whether) to invoke it.
    pub fn decorate<R2, F>(self, mut f: F) -> Awaitable<'a, R2>
    where
        F: FnMut(&mut (dyn FnMut() -> Result<R> + Send + 'a)) -> Result<R2> + Send + 'a,
        R: 'a,
    {
        let mut react = self.react;
        Awaitable {
            trigger: self.trigger,
            react: Box::new(move || f(&mut *react)),
        }
    }
}

impl<R> std::fmt::Debug for Awaitable<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awaitable")
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// An awaitable that never fires.
#[must_use]
pub fn never() -> Awaitable<'static, ()> {
    Awaitable::new(Trigger::Never, || Ok(()))
}

/// An awaitable that fires immediately.
#[must_use]
pub fn always() -> Awaitable<'static, ()> {
    Awaitable::new(Trigger::Always, || Ok(()))
}

/// An awaitable that fires once, `duration` after the wait starts.
#[must_use]
pub fn timeout(duration: Duration) -> Awaitable<'static, ()> {
    Awaitable::new(Trigger::Timeout(duration), || Ok(()))
}

/// An awaitable that fires every `interval` until the wait finishes.
///
/// Polling triggers bound how long the wait sleeps between re-checks; a
/// polling reaction that returns `TryAgain` does not complete the wait.
#[must_use]
pub fn polling(interval: Duration) -> Awaitable<'static, ()> {
    Awaitable::new(Trigger::Polling(interval), || Ok(()))
}

/// An awaitable that fires once at the absolute time point `when`.
///
/// A `when` in the past fires on the first wake.
#[must_use]
pub fn deadline_at(when: Instant) -> Awaitable<'static, ()> {
    let remaining = when.saturating_duration_since(Instant::now());
    Awaitable::new(Trigger::Timeout(remaining), || Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn then_pipes_results() {
        let mut a = always().then(|()| 7).then(|n| n * 6);
        assert_eq!(a.react().unwrap(), 42);
    }

    #[test]
    fn and_then_propagates_errors() {
        let mut a = always().and_then(|()| -> Result<u32> { Err(Error::eof("gone")) });
        assert_eq!(a.react().unwrap_err().kind(), ErrorKind::Eof);
    }

    #[test]
    fn except_kind_handles_matching_errors() {
        let mut a = always()
            .and_then(|()| -> Result<u32> { Err(Error::eof("gone")) })
            .except_kind(ErrorKind::Eof, |_| Ok(0));
        assert_eq!(a.react().unwrap(), 0);
    }

    #[test]
    fn except_kind_passes_other_errors_through() {
        let mut a = always()
            .and_then(|()| -> Result<u32> { Err(Error::io("boom")) })
            .except_kind(ErrorKind::Eof, |_| Ok(0));
        assert_eq!(a.react().unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn decorate_wraps_the_reaction() {
        let mut calls = 0;
        {
            let mut a = always().then(|()| 1).decorate(|inner| {
                calls += 1;
                let v = inner()?;
                Ok(v + 1)
            });
            assert_eq!(a.react().unwrap(), 2);
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn deadline_in_the_past_degrades_to_zero_timeout() {
        let a = deadline_at(Instant::now() - Duration::from_secs(1));
        assert_eq!(a.trigger(), Trigger::Timeout(Duration::ZERO));
    }

    #[test]
    fn composition_preserves_trigger() {
        let a = timeout(Duration::from_millis(5)).then(|()| "done");
        assert_eq!(a.trigger(), Trigger::Timeout(Duration::from_millis(5)));
    }
}
