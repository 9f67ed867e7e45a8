//! Execution contexts with deadlines, cancellation, and call metadata.
//!
//! Contexts form a tree rooted at a process-wide sentinel. Every node
//! carries an optional deadline, a sticky cancellation flag, and a bag of
//! typed values keyed by portable class name. Cancelling a node cancels its
//! whole subtree; deadlines only ever tighten, so a child's effective
//! deadline is never later than its parent's.
//!
//! Each thread keeps a stack of "current" contexts. Entering a context
//! ([`Context::enter`]) pushes it for the scope of the returned guard;
//! [`select`](crate::select::select) reads the top of the stack to weave
//! cancellation and deadline into every wait.
//!
//! A context crosses process boundaries as `{remaining deadline, data bag,
//! cancelled}`; [`Context::apply_wire`] installs a received snapshot onto a
//! fresh child so a server-side call mirrors its caller.

use crate::awaitable::{deadline_at, never, Awaitable};
use crate::error::{Error, Result};
use crate::sync::flag::Flag;
use crate::util::FlatMap;
use crate::wire::{self, ContextValue, Portable, Wire, WireReader};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

struct NodeState {
    deadline: Option<Instant>,
    data: FlatMap<String, Arc<dyn ContextValue>>,
}

struct Node {
    parent: Option<Arc<Node>>,
    children: Mutex<Vec<Weak<Node>>>,
    child_detached: Condvar,
    cancelled: Flag,
    state: Mutex<NodeState>,
}

impl Node {
    fn cancel(node: &Arc<Node>) {
        let children: Vec<Arc<Node>> = node
            .children
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for child in &children {
            Self::cancel(child);
        }
        node.cancelled.set();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            {
                let mut children = parent.children.lock();
                children.retain(|w| w.strong_count() > 0);
            }
            parent.child_detached.notify_all();
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

/// A node in the context tree. Cloning shares the node.
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    fn from_parts(parent: Option<Arc<Node>>, inherited: NodeState) -> Result<Self> {
        Ok(Self {
            node: Arc::new(Node {
                parent,
                children: Mutex::new(Vec::new()),
                child_detached: Condvar::new(),
                cancelled: Flag::new()?,
                state: Mutex::new(inherited),
            }),
        })
    }

    /// The process-wide root context.
    ///
    /// # Panics
    ///
    /// Panics if the root's signal descriptors cannot be allocated; this
    /// only happens when the process is already out of file descriptors.
    #[must_use]
    pub fn top() -> Self {
        static TOP: OnceLock<Context> = OnceLock::new();
        TOP.get_or_init(|| {
            Context::from_parts(
                None,
                NodeState {
                    deadline: None,
                    data: FlatMap::new(),
                },
            )
            .expect("root context allocation")
        })
        .clone()
    }

    /// The innermost context entered on this thread, or the root.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|stack| stack.borrow().last().cloned().unwrap_or_else(Self::top))
    }

    /// Creates a child of this context.
    ///
    /// The child inherits the deadline and data bag, and is cancelled
    /// whenever an ancestor is cancelled.
    ///
    /// # Errors
    ///
    /// Fails if the child's signal descriptors cannot be allocated.
    pub fn child(&self) -> Result<Self> {
        self.child_inner(false)
    }

    /// Creates a detached child: it inherits the deadline and data bag but
    /// does not receive cancellation from its ancestors.
    ///
    /// # Errors
    ///
    /// Fails if the child's signal descriptors cannot be allocated.
    pub fn shielded_child(&self) -> Result<Self> {
        self.child_inner(true)
    }

    /// Creates a child of the current context.
    ///
    /// # Errors
    ///
    /// Fails if the child's signal descriptors cannot be allocated.
    pub fn child_of_current() -> Result<Self> {
        Self::current().child()
    }

    fn child_inner(&self, shield: bool) -> Result<Self> {
        let inherited = {
            let state = self.node.state.lock();
            NodeState {
                deadline: state.deadline,
                data: state.data.clone(),
            }
        };
        let parent = if shield {
            None
        } else {
            Some(Arc::clone(&self.node))
        };
        let child = Self::from_parts(parent, inherited)?;
        if !shield {
            self.node
                .children
                .lock()
                .push(Arc::downgrade(&child.node));
            // A parent cancelled concurrently with this registration must
            // still reach the new child.
            if self.node.cancelled.is_set() {
                Node::cancel(&child.node);
            }
        }
        Ok(child)
    }

    /// Makes this context current for the scope of the returned guard.
    #[must_use]
    pub fn enter(&self) -> ScopeGuard {
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        ScopeGuard {
            _not_send: PhantomData,
        }
    }

    /// Cancels this context and, recursively, every descendant.
    pub fn cancel(&self) {
        Node::cancel(&self.node);
    }

    /// Returns true if this context (or, transitively, an ancestor) has
    /// been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.node.cancelled.is_set()
    }

    /// Returns the effective deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.node.state.lock().deadline
    }

    /// Returns the time remaining until the deadline, clamped at zero.
    #[must_use]
    pub fn deadline_left(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Installs an absolute deadline. Deadlines only tighten: a later
    /// `when` than the current deadline is ignored.
    pub fn set_deadline(&self, when: Instant) {
        let mut state = self.node.state.lock();
        match state.deadline {
            Some(existing) if existing <= when => {}
            _ => state.deadline = Some(when),
        }
    }

    /// Installs a deadline `timeout` from now.
    pub fn set_timeout(&self, timeout: Duration) {
        self.set_deadline(Instant::now() + timeout);
    }

    /// An awaitable that fires with `cancelled` once this context is
    /// cancelled.
    #[must_use]
    pub fn wait_cancelled(&self) -> Awaitable<'static, ()> {
        self.node
            .cancelled
            .async_wait()
            .and_then(|()| Err(Error::cancelled("context cancelled")))
    }

    /// An awaitable that fires with `deadline_exceeded` once the deadline
    /// passes; never fires when no deadline is set.
    #[must_use]
    pub fn wait_deadline(&self) -> Awaitable<'static, ()> {
        match self.deadline() {
            Some(when) => {
                deadline_at(when).and_then(|()| Err(Error::deadline_exceeded("context deadline")))
            }
            None => never(),
        }
    }

    /// Stores `value` in the data bag, keyed by its portable class name.
    /// Replaces any previous value of the same type.
    pub fn set<T>(&self, value: T)
    where
        T: Wire + Portable + Any + Send + Sync + fmt::Debug,
    {
        self.node
            .state
            .lock()
            .data
            .replace(T::CLASS_NAME.to_string(), Arc::new(value));
    }

    /// Returns a copy of the stored value of type `T`, or a
    /// default-constructed sentinel when absent.
    #[must_use]
    pub fn get<T>(&self) -> T
    where
        T: Wire + Portable + Any + Send + Sync + fmt::Debug + Clone + Default,
    {
        self.node
            .state
            .lock()
            .data
            .get(&T::CLASS_NAME.to_string())
            .and_then(|v| v.as_any().downcast_ref::<T>().cloned())
            .unwrap_or_default()
    }

    /// Removes the stored value of type `T`, if any.
    pub fn reset<T>(&self)
    where
        T: Portable,
    {
        self.node
            .state
            .lock()
            .data
            .remove(&T::CLASS_NAME.to_string());
    }

    /// Empties the data bag.
    pub fn reset_all(&self) {
        self.node.state.lock().data.clear();
    }

    /// Blocks until every child context has detached.
    pub fn wait_children(&self) {
        let mut children = self.node.children.lock();
        loop {
            children.retain(|w| w.strong_count() > 0);
            if children.is_empty() {
                return;
            }
            self.node.child_detached.wait(&mut children);
        }
    }

    /// Appends the wire snapshot: remaining deadline, data bag, cancelled.
    pub fn encode_wire(&self, buf: &mut Vec<u8>) {
        let (deadline_left, entries) = {
            let state = self.node.state.lock();
            let left = state
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()));
            let entries: Vec<(String, Vec<u8>)> = state
                .data
                .iter()
                .map(|(name, value)| {
                    let mut payload = Vec::new();
                    value.encode_payload(&mut payload);
                    (name.clone(), payload)
                })
                .collect();
            (left, entries)
        };
        deadline_left.encode(buf);
        entries.encode(buf);
        self.is_cancelled().encode(buf);
    }

    /// Installs a received wire snapshot onto this context: the remaining
    /// deadline becomes a timeout, the data bag is replaced, and the
    /// context is cancelled if the sender's was.
    ///
    /// # Errors
    ///
    /// `data_mismatch` for malformed input or unregistered value classes.
    pub fn apply_wire(&self, r: &mut WireReader<'_>) -> Result<()> {
        let deadline_left: Option<Duration> = Wire::decode(r)?;
        let entries: Vec<(String, Vec<u8>)> = Wire::decode(r)?;
        let cancelled: bool = Wire::decode(r)?;

        let mut data = FlatMap::new();
        for (name, payload) in entries {
            let value = wire::decode_context_value(&name, &payload)?;
            data.replace(name, value);
        }

        if let Some(left) = deadline_left {
            self.set_timeout(left);
        }
        self.node.state.lock().data = data;
        if cancelled {
            self.cancel();
        }
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline())
            .finish_non_exhaustive()
    }
}

/// Restores the previous current context when dropped.
///
/// The guard is not `Send`: it must be dropped on the thread that created
/// it, so early returns and panics still unwind the stack correctly.
pub struct ScopeGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
