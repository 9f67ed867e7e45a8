//! Waiting on heterogeneous awaitables.
//!
//! [`select`] blocks the calling thread until at least one of the supplied
//! awaitables fires, then returns a tuple with one `Option` slot per input:
//! `Some(result)` for every awaitable that fired on this call, `None` for
//! the rest. All entries ready at the moment of the wake are reported
//! together.
//!
//! The current [`Context`](crate::context::Context) is woven into every
//! wait: its cancellation flag and deadline participate as two additional
//! triggers whose firing aborts the call with `cancelled` or
//! `deadline_exceeded`. They are evaluated before any user reaction runs,
//! so a cancelled wait never executes user side effects.
//!
//! # Scheduling model
//!
//! Threads are single-tasked: while in `select` a thread is blocked on the
//! kernel readiness primitive (epoll/kqueue via the `polling` crate).
//! Reactions run synchronously on the waking thread and must not block.

use crate::awaitable::{Awaitable, Trigger};
use crate::context::Context;
use crate::error::{Error, Result};
use polling::{Event, Events, Poller};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

/// One wait participant inside the engine.
struct Entry<'e> {
    trigger: Trigger,
    /// Next absolute firing time for timer-like triggers.
    target: Option<Instant>,
    run: &'e mut dyn FnMut() -> Result<bool>,
}

impl<'e> Entry<'e> {
    fn new(trigger: Trigger, run: &'e mut dyn FnMut() -> Result<bool>) -> Self {
        Self {
            trigger,
            target: None,
            run,
        }
    }

    /// Anchors timer triggers relative to the start of the wait.
    fn anchor(&mut self, start: Instant) {
        self.target = match self.trigger {
            Trigger::Timeout(d) | Trigger::Polling(d) => Some(start + d),
            _ => None,
        };
    }
}

/// Runs one reaction, translating its outcome for the engine:
/// `Ok(true)` populated its slot, `Ok(false)` was a spurious wake.
fn run_reaction<R>(a: &mut Awaitable<'_, R>, out: &mut Option<R>) -> Result<bool> {
    match a.react() {
        Ok(v) => {
            *out = Some(v);
            Ok(true)
        }
        Err(e) if e.is_try_again() => Ok(false),
        Err(e) => Err(e),
    }
}

/// A registered fd with the union of the interests of its entries.
struct FdReg {
    fd: RawFd,
    readable: bool,
    writable: bool,
}

impl FdReg {
    fn event(&self, key: usize) -> Event {
        match (self.readable, self.writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// Collects the distinct fds across all entries, merging interests so the
/// same descriptor can appear in several awaitables of one wait.
fn collect_fd_regs<'e>(entries: &[&[Entry<'e>]]) -> Vec<FdReg> {
    let mut regs: Vec<FdReg> = Vec::new();
    for list in entries {
        for entry in list.iter() {
            let (fd, write) = match entry.trigger {
                Trigger::Readable(fd) => (fd, false),
                Trigger::Writable(fd) => (fd, true),
                _ => continue,
            };
            if let Some(reg) = regs.iter_mut().find(|r| r.fd == fd) {
                reg.readable |= !write;
                reg.writable |= write;
            } else {
                regs.push(FdReg {
                    fd,
                    readable: !write,
                    writable: write,
                });
            }
        }
    }
    regs
}

fn entry_fired(trigger: Trigger, target: Option<Instant>, now: Instant, events: &Events, regs: &[FdReg]) -> bool {
    match trigger {
        Trigger::Readable(fd) => events.iter().any(|ev| {
            ev.readable && regs.get(ev.key).map(|r| r.fd) == Some(fd)
        }),
        Trigger::Writable(fd) => events.iter().any(|ev| {
            ev.writable && regs.get(ev.key).map(|r| r.fd) == Some(fd)
        }),
        Trigger::Timeout(_) | Trigger::Polling(_) => target.is_some_and(|t| t <= now),
        Trigger::Never => false,
        Trigger::Always => true,
    }
}

/// The wait loop shared by all select arities.
///
/// `hidden` holds the context's cancellation and deadline entries; they are
/// processed before `user` entries so cancellation wins over results.
/// Returns once at least one entry has populated its slot.
fn select_core<'e>(hidden: &mut [Entry<'e>], user: &mut [Entry<'e>]) -> Result<()> {
    let poller = Poller::new().map_err(|e| Error::from_io(e, "readiness poller"))?;
    let regs = collect_fd_regs(&[&*hidden, &*user]);

    for (key, reg) in regs.iter().enumerate() {
        // SAFETY: every registered fd is owned by a `Channel` or `Flag`
        // borrowed by its awaitable for the duration of this call, so it
        // stays open until the poller is dropped on return.
        unsafe {
            poller
                .add(reg.fd, reg.event(key))
                .map_err(|e| Error::from_io(e, "readiness registration"))?;
        }
    }

    let start = Instant::now();
    for entry in hidden.iter_mut().chain(user.iter_mut()) {
        entry.anchor(start);
    }

    let mut events = Events::new();
    loop {
        let now = Instant::now();
        let mut wait_for: Option<Duration> = None;
        let mut immediate = false;
        for entry in hidden.iter().chain(user.iter()) {
            match entry.trigger {
                Trigger::Always => immediate = true,
                Trigger::Timeout(_) | Trigger::Polling(_) => {
                    if let Some(target) = entry.target {
                        let left = target.saturating_duration_since(now);
                        wait_for = Some(wait_for.map_or(left, |w| w.min(left)));
                    }
                }
                _ => {}
            }
        }
        if immediate {
            wait_for = Some(Duration::ZERO);
        }

        events.clear();
        match poller.wait(&mut events, wait_for) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::from_io(e, "readiness wait")),
        }

        let now = Instant::now();
        let mut populated = false;
        for entry in hidden.iter_mut().chain(user.iter_mut()) {
            if !entry_fired(entry.trigger, entry.target, now, &events, &regs) {
                continue;
            }
            match entry.trigger {
                // One-shot timers are spent after firing.
                Trigger::Timeout(_) => entry.target = None,
                // Polling timers re-arm for the next tick.
                Trigger::Polling(d) => entry.target = Some(now + d),
                _ => {}
            }
            populated |= (entry.run)()?;
        }
        if populated {
            return Ok(());
        }

        // Not done yet: re-arm the oneshot fd registrations for the next
        // pass (delivered events disarm them inside the poller).
        for (key, reg) in regs.iter().enumerate() {
            // SAFETY: same ownership argument as for `add` above.
            let fd = unsafe { BorrowedFd::borrow_raw(reg.fd) };
            poller
                .modify(fd, reg.event(key))
                .map_err(|e| Error::from_io(e, "readiness re-arm"))?;
        }
    }
}

/// A heterogeneous set of awaitables accepted by [`select`].
///
/// Implemented for tuples of one to six awaitables.
pub trait SelectSet {
    /// One `Option` slot per input awaitable.
    type Output;

    /// Waits until at least one member fires; see [`select`].
    fn wait_any(self) -> Result<Self::Output>;
}

/// Waits on all supplied awaitables concurrently.
///
/// Returns a tuple holding `Some(result)` for every awaitable that fired on
/// this call and `None` for the others. At least one slot is populated on
/// success.
///
/// # Errors
///
/// - `cancelled` if the current context is (or becomes) cancelled
/// - `deadline_exceeded` if the current context's deadline expires first
/// - any error raised by a fired reaction and not absorbed by its
///   exception-handler chain
pub fn select<S: SelectSet>(set: S) -> Result<S::Output> {
    set.wait_any()
}

macro_rules! impl_select_set {
    ($(($a:ident, $f:ident, $o:ident, $t:ident, $R:ident)),+) => {
        impl<'a, $($R),+> SelectSet for ($(Awaitable<'a, $R>,)+) {
            type Output = ($(Option<$R>,)+);

            fn wait_any(self) -> Result<Self::Output> {
                let ($(mut $a,)+) = self;
                $(let $t = $a.trigger();)+
                $(let mut $o: Option<$R> = None;)+
                {
                    let ctx = Context::current();
                    let mut cancel_aw = ctx.wait_cancelled();
                    let mut deadline_aw = ctx.wait_deadline();
                    let cancel_trigger = cancel_aw.trigger();
                    let deadline_trigger = deadline_aw.trigger();
                    let mut cancel_slot = None;
                    let mut deadline_slot = None;
                    let mut cancel_run = || run_reaction(&mut cancel_aw, &mut cancel_slot);
                    let mut deadline_run = || run_reaction(&mut deadline_aw, &mut deadline_slot);
                    let mut hidden = [
                        Entry::new(cancel_trigger, &mut cancel_run),
                        Entry::new(deadline_trigger, &mut deadline_run),
                    ];
                    $(let mut $f = || run_reaction(&mut $a, &mut $o);)+
                    let mut user = [$(Entry::new($t, &mut $f)),+];
                    select_core(&mut hidden, &mut user)?;
                }
                Ok(($($o,)+))
            }
        }
    };
}

impl_select_set!((a0, f0, o0, t0, R0));
impl_select_set!((a0, f0, o0, t0, R0), (a1, f1, o1, t1, R1));
impl_select_set!((a0, f0, o0, t0, R0), (a1, f1, o1, t1, R1), (a2, f2, o2, t2, R2));
impl_select_set!(
    (a0, f0, o0, t0, R0),
    (a1, f1, o1, t1, R1),
    (a2, f2, o2, t2, R2),
    (a3, f3, o3, t3, R3)
);
impl_select_set!(
    (a0, f0, o0, t0, R0),
    (a1, f1, o1, t1, R1),
    (a2, f2, o2, t2, R2),
    (a3, f3, o3, t3, R3),
    (a4, f4, o4, t4, R4)
);
impl_select_set!(
    (a0, f0, o0, t0, R0),
    (a1, f1, o1, t1, R1),
    (a2, f2, o2, t2, R2),
    (a3, f3, o3, t3, R3),
    (a4, f4, o4, t4, R4),
    (a5, f5, o5, t5, R5)
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaitable::{always, never, timeout};
    use crate::sync::flag::Flag;
    use std::time::Duration;

    #[test]
    fn always_fires_immediately() {
        let (got,) = select((always().then(|()| 42),)).unwrap();
        assert_eq!(got, Some(42));
    }

    #[test]
    fn timer_fires_after_duration() {
        let start = Instant::now();
        let (fired, _) = select((timeout(Duration::from_millis(30)), never())).unwrap();
        assert_eq!(fired, Some(()));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn shorter_timer_wins() {
        let (short, long) = select((
            timeout(Duration::from_millis(10)),
            timeout(Duration::from_secs(30)),
        ))
        .unwrap();
        assert_eq!(short, Some(()));
        assert_eq!(long, None);
    }

    #[test]
    fn simultaneously_ready_entries_are_reported_together() {
        let a = Flag::new().unwrap();
        let b = Flag::new().unwrap();
        a.set();
        b.set();
        let (ra, rb) = select((a.async_wait(), b.async_wait())).unwrap();
        assert_eq!(ra, Some(()));
        assert_eq!(rb, Some(()));
    }

    #[test]
    fn single_ready_entry_populates_only_its_slot() {
        let a = Flag::new().unwrap();
        let b = Flag::new().unwrap();
        b.set();
        let (ra, rb) = select((a.async_wait(), b.async_wait())).unwrap();
        assert_eq!(ra, None);
        assert_eq!(rb, Some(()));
    }

    #[test]
    fn flag_set_from_another_thread_wakes_the_wait() {
        let flag = Flag::new().unwrap();
        let setter = flag.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        let (fired, timer) = select((flag.async_wait(), timeout(Duration::from_secs(5)))).unwrap();
        assert_eq!(fired, Some(()));
        assert_eq!(timer, None);
        handle.join().unwrap();
    }

    #[test]
    fn polling_trigger_does_not_terminate_when_rechecking() {
        // The polling reaction keeps reporting "nothing to do"; the timer
        // must end the wait while the poll only bounds the sleep.
        let (polled, timer) = select((
            crate::awaitable::polling(Duration::from_millis(5))
                .and_then(|()| -> Result<()> { Err(Error::try_again("nothing yet")) }),
            timeout(Duration::from_millis(40)),
        ))
        .unwrap();
        assert_eq!(polled, None);
        assert_eq!(timer, Some(()));
    }

    #[test]
    fn reaction_errors_propagate() {
        let err = select((always().and_then(|()| -> Result<()> { Err(Error::eof("done")) }),))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Eof);
    }

    #[test]
    fn always_plus_ready_fd_report_together() {
        let flag = Flag::new().unwrap();
        flag.set();
        let (a, b) = select((always(), flag.async_wait())).unwrap();
        assert_eq!(a, Some(()));
        assert_eq!(b, Some(()));
    }
}
