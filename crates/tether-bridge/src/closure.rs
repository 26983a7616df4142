//! Closure trampoline.
//!
//! A closure created inside the module is a pair of words `(a, b)` that only
//! the module can interpret, plus a destructor id. The host wraps the pair in
//! a [`HostClosure`] and calls back into the module through one dispatch
//! export per arity.
//!
//! Lifetime is reference counted. The wrapper starts with one live reference,
//! owned by the module, which may give it up once. Every invocation holds an
//! extra reference for its duration, zeroes `a` and marks the closure
//! running so a nested call fails instead of re-entering the module's
//! closure. When the module drops its reference while a call is in
//! flight, the call runs the guest destructor as it unwinds. When the host
//! forgets a wrapper the module never dropped, [`Drop`] queues the destructor
//! on a [`FinalizationQueue`] that the bridge drains at its next call
//! boundary.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{BridgeError, Result};

/// Argument count of a closure, selecting its dispatch export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    /// `tether_call0(a, b)`
    Zero,
    /// `tether_call1(a, b, x)`
    One,
    /// `tether_call2(a, b, x, y)`
    Two,
    /// `tether_call3(a, b, x, y, z)`
    Three,
}

impl Arity {
    /// Decode the tag passed to `closure_new`.
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Arity::Zero),
            1 => Ok(Arity::One),
            2 => Ok(Arity::Two),
            3 => Ok(Arity::Three),
            other => Err(BridgeError::UnknownArity(other)),
        }
    }

    /// Number of argument handles.
    pub fn count(self) -> usize {
        self as usize
    }

    /// Name of the dispatch export.
    pub fn export_name(self) -> &'static str {
        match self {
            Arity::Zero => "tether_call0",
            Arity::One => "tether_call1",
            Arity::Two => "tether_call2",
            Arity::Three => "tether_call3",
        }
    }
}

/// Guest-side destructor selector passed back to `tether_closure_destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestructorId(pub u32);

/// The module side of the trampoline.
pub trait Dispatcher {
    /// Call the module's closure `(a, b)` with argument handles.
    fn dispatch(&mut self, arity: Arity, a: u32, b: u32, args: &[u32]) -> Result<()>;

    /// Run the module's destructor for `(a, b)`.
    fn destroy(&mut self, a: u32, b: u32, dtor: DestructorId) -> Result<()>;
}

/// How a dispatched invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The closure returned normally
    Returned,
    /// The module trapped; closure bookkeeping already ran
    Trapped(BridgeError),
}

/// Destructor call owed to the module for a wrapper the host forgot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finalizer {
    /// Closure data word
    pub a: u32,
    /// Closure vtable word
    pub b: u32,
    /// Destructor selector
    pub dtor: DestructorId,
}

/// Pending finalizers, shared between every closure of one bridge instance.
#[derive(Clone, Default)]
pub struct FinalizationQueue(Arc<Mutex<Vec<Finalizer>>>);

impl FinalizationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, Vec<Finalizer>> {
        // The lock is never held across a call that can panic.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, finalizer: Finalizer) {
        self.pending().push(finalizer);
    }

    /// Number of destructors waiting to run.
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Run every pending destructor, including ones queued while running.
    ///
    /// A failing destructor does not stop the drain; the first error is
    /// returned once the queue is empty.
    pub fn run<D: Dispatcher + ?Sized>(&self, dispatcher: &mut D) -> Result<usize> {
        let mut ran = 0;
        let mut first_err = None;
        loop {
            let batch = std::mem::take(&mut *self.pending());
            if batch.is_empty() {
                break;
            }
            for f in batch {
                tracing::debug!(a = f.a, b = f.b, dtor = f.dtor.0, "finalizing forgotten closure");
                if let Err(e) = dispatcher.destroy(f.a, f.b, f.dtor) {
                    first_err.get_or_insert(e);
                }
                ran += 1;
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(ran),
        }
    }
}

impl fmt::Debug for FinalizationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizationQueue")
            .field("pending", &self.len())
            .finish()
    }
}

struct ClosureState {
    /// Zero while an invocation is running or after teardown.
    a: AtomicU32,
    /// Data word as created; dispatch and the finalizer use it.
    original_a: u32,
    b: u32,
    /// The module's own reference plus one per in-flight call.
    live: AtomicU32,
    running: AtomicBool,
    released: AtomicBool,
    destroyed: AtomicBool,
    dtor: DestructorId,
    arity: Arity,
    finalizers: FinalizationQueue,
}

impl ClosureState {
    /// Drop one reference and return what is left.
    fn unref(&self) -> Result<u32> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| BridgeError::ClosureUnavailable)
    }
}

impl Drop for ClosureState {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.finalizers.push(Finalizer {
                a: self.original_a,
                b: self.b,
                dtor: self.dtor,
            });
        }
    }
}

/// Host-callable wrapper around a module closure.
#[derive(Clone)]
pub struct HostClosure(Arc<ClosureState>);

impl HostClosure {
    /// Wrap `(a, b)` with one live reference owned by the module.
    pub fn new(
        a: u32,
        b: u32,
        dtor: DestructorId,
        arity: Arity,
        finalizers: &FinalizationQueue,
    ) -> Self {
        HostClosure(Arc::new(ClosureState {
            a: AtomicU32::new(a),
            original_a: a,
            b,
            live: AtomicU32::new(1),
            running: AtomicBool::new(false),
            released: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            dtor,
            arity,
            finalizers: finalizers.clone(),
        }))
    }

    /// Arity fixed at creation.
    pub fn arity(&self) -> Arity {
        self.0.arity
    }

    /// Outstanding references: the module's own plus in-flight calls.
    pub fn live(&self) -> u32 {
        self.0.live.load(Ordering::Acquire)
    }

    /// True while an invocation is on the stack.
    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::Acquire)
    }

    /// True once the module's environment was released.
    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.load(Ordering::Acquire)
    }

    /// True if both wrappers share one closure state.
    pub fn ptr_eq(&self, other: &HostClosure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Call into the module with argument handles.
    ///
    /// Fails with `ClosureUnavailable` when the closure is running or was
    /// destroyed. A trap inside the module is reported as
    /// [`Completion::Trapped`] after the bookkeeping (restore `a` or run
    /// the destructor) has completed.
    pub fn invoke<D: Dispatcher + ?Sized>(
        &self,
        dispatcher: &mut D,
        args: &[u32],
    ) -> Result<Completion> {
        let state = &self.0;
        if args.len() != state.arity.count() {
            return Err(BridgeError::ArityMismatch {
                expected: state.arity.count(),
                got: args.len(),
            });
        }
        if state.destroyed.load(Ordering::Acquire)
            || state
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(BridgeError::ClosureUnavailable);
        }

        let a = state.original_a;
        state.live.fetch_add(1, Ordering::AcqRel);
        state.a.store(0, Ordering::Release);
        let outcome = dispatcher.dispatch(state.arity, a, state.b, args);

        let teardown = match state.unref() {
            Ok(0) => {
                state.destroyed.store(true, Ordering::Release);
                tracing::debug!(a, b = state.b, "closure dropped during its own call, destroying");
                dispatcher.destroy(a, state.b, state.dtor)
            }
            Ok(_) => {
                state.a.store(a, Ordering::Release);
                Ok(())
            }
            Err(e) => Err(e),
        };
        state.running.store(false, Ordering::Release);

        Ok(match outcome.and(teardown) {
            Ok(()) => Completion::Returned,
            Err(e) => Completion::Trapped(e),
        })
    }

    /// Drop the module's reference (the `cb_drop` import).
    ///
    /// Returns `true` when this was the last reference and nothing is
    /// running: the module must release the environment itself. Returns
    /// `false` when a call is in flight; that call destroys the closure as
    /// it unwinds. The module holds exactly one reference, so a second
    /// release fails with `ClosureUnavailable`.
    pub fn release(&self) -> Result<bool> {
        let state = &self.0;
        if state.destroyed.load(Ordering::Acquire) || state.released.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::ClosureUnavailable);
        }
        if state.unref()? == 0 {
            state.a.store(0, Ordering::Release);
            state.destroyed.store(true, Ordering::Release);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl fmt::Debug for HostClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostClosure")
            .field("a", &self.0.a.load(Ordering::Relaxed))
            .field("b", &self.0.b)
            .field("live", &self.0.live.load(Ordering::Relaxed))
            .field("arity", &self.0.arity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGuest;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn closure(queue: &FinalizationQueue, arity: Arity) -> HostClosure {
        HostClosure::new(100, 200, DestructorId(7), arity, queue)
    }

    #[test]
    fn test_invoke_restores_state() {
        let queue = FinalizationQueue::new();
        let c = closure(&queue, Arity::One);
        let mut guest = FakeGuest::with_pages(1);

        assert_eq!(c.invoke(&mut guest, &[42]).unwrap(), Completion::Returned);
        assert_eq!(c.invoke(&mut guest, &[43]).unwrap(), Completion::Returned);
        assert_eq!(
            guest.dispatched,
            vec![(Arity::One, 100, 200, vec![42]), (Arity::One, 100, 200, vec![43])]
        );
        assert_eq!(c.live(), 1);
        assert!(!c.is_running());
        assert!(guest.destroyed.is_empty());
    }

    #[test]
    fn test_drop_during_invocation_destroys_once_after() {
        let queue = FinalizationQueue::new();
        let c = closure(&queue, Arity::Zero);
        let mut guest = FakeGuest::with_pages(1);

        let inner = c.clone();
        guest.hook = Some(Box::new(move |_, _, _, _: &[u32]| {
            assert!(!inner.release()?);
            Ok(())
        }));

        assert_eq!(c.invoke(&mut guest, &[]).unwrap(), Completion::Returned);
        assert_eq!(guest.destroyed, vec![(100, 200, DestructorId(7))]);
        assert!(c.is_destroyed());

        assert_eq!(c.invoke(&mut guest, &[]), Err(BridgeError::ClosureUnavailable));
        assert_eq!(c.release(), Err(BridgeError::ClosureUnavailable));
        guest.hook = None;
        drop(c);
        assert!(queue.is_empty());
        assert_eq!(guest.destroyed.len(), 1);
    }

    #[test]
    fn test_second_release_during_invocation_rejected() {
        let queue = FinalizationQueue::new();
        let c = closure(&queue, Arity::One);
        let mut guest = FakeGuest::with_pages(1);

        let inner = c.clone();
        let results = Rc::new(RefCell::new(Vec::new()));
        let seen = results.clone();
        guest.hook = Some(Box::new(move |_, _, _, _: &[u32]| {
            seen.borrow_mut().push(inner.release());
            seen.borrow_mut().push(inner.release());
            Ok(())
        }));

        assert_eq!(c.invoke(&mut guest, &[9]).unwrap(), Completion::Returned);
        assert_eq!(
            *results.borrow(),
            vec![Ok(false), Err(BridgeError::ClosureUnavailable)]
        );
        assert_eq!(guest.destroyed, vec![(100, 200, DestructorId(7))]);
        assert!(c.is_destroyed());
        assert!(!c.is_running());
        assert_eq!(c.live(), 0);
        guest.hook = None;
    }

    #[test]
    fn test_release_twice_when_idle() {
        let queue = FinalizationQueue::new();
        let c = closure(&queue, Arity::Zero);
        assert!(c.release().unwrap());
        assert_eq!(c.release(), Err(BridgeError::ClosureUnavailable));
        assert_eq!(c.live(), 0);
    }

    #[test]
    fn test_zero_data_word_is_invocable() {
        let queue = FinalizationQueue::new();
        let c = HostClosure::new(0, 200, DestructorId(1), Arity::Zero, &queue);
        let mut guest = FakeGuest::with_pages(1);

        assert!(!c.is_running());
        assert_eq!(c.invoke(&mut guest, &[]).unwrap(), Completion::Returned);
        assert_eq!(c.invoke(&mut guest, &[]).unwrap(), Completion::Returned);
        assert_eq!(guest.dispatched.len(), 2);
        assert!(c.release().unwrap());
    }

    #[test]
    fn test_release_when_idle() {
        let queue = FinalizationQueue::new();
        let c = closure(&queue, Arity::Two);
        let mut guest = FakeGuest::with_pages(1);

        assert!(c.release().unwrap());
        assert!(c.is_destroyed());
        assert_eq!(c.invoke(&mut guest, &[1, 2]), Err(BridgeError::ClosureUnavailable));
        drop(c);
        assert!(queue.is_empty());
        assert!(guest.destroyed.is_empty());
    }

    #[test]
    fn test_reentrant_call_rejected() {
        let queue = FinalizationQueue::new();
        let c = closure(&queue, Arity::Zero);
        let mut guest = FakeGuest::with_pages(1);

        let inner = c.clone();
        let nested = Rc::new(RefCell::new(None));
        let seen = nested.clone();
        guest.hook = Some(Box::new(move |_, _, _, _: &[u32]| {
            assert!(inner.is_running());
            *seen.borrow_mut() = Some(inner.invoke(&mut FakeGuest::with_pages(0), &[]));
            Ok(())
        }));

        assert_eq!(c.invoke(&mut guest, &[]).unwrap(), Completion::Returned);
        assert_eq!(
            nested.borrow_mut().take(),
            Some(Err(BridgeError::ClosureUnavailable))
        );
        assert_eq!(guest.dispatched.len(), 1);
        guest.hook = None;
    }

    #[test]
    fn test_trap_still_restores() {
        let queue = FinalizationQueue::new();
        let c = closure(&queue, Arity::Zero);
        let mut guest = FakeGuest::with_pages(1);
        guest.hook = Some(Box::new(|_, _, _, _: &[u32]| {
            Err(BridgeError::Wasm("unreachable".into()))
        }));

        assert_eq!(
            c.invoke(&mut guest, &[]).unwrap(),
            Completion::Trapped(BridgeError::Wasm("unreachable".into()))
        );
        assert_eq!(c.live(), 1);
        guest.hook = None;
        assert_eq!(c.invoke(&mut guest, &[]).unwrap(), Completion::Returned);
    }

    #[test]
    fn test_finalizer_backstop() {
        let queue = FinalizationQueue::new();
        let c = closure(&queue, Arity::Three);
        let copy = c.clone();
        drop(c);
        assert!(queue.is_empty());
        drop(copy);
        assert_eq!(queue.len(), 1);

        let mut guest = FakeGuest::with_pages(1);
        assert_eq!(queue.run(&mut guest).unwrap(), 1);
        assert_eq!(guest.destroyed, vec![(100, 200, DestructorId(7))]);
        assert_eq!(queue.run(&mut guest).unwrap(), 0);
        assert_eq!(guest.destroyed.len(), 1);
    }

    #[test]
    fn test_arity_checks() {
        let queue = FinalizationQueue::new();
        let c = closure(&queue, Arity::Two);
        let mut guest = FakeGuest::with_pages(1);
        assert_eq!(
            c.invoke(&mut guest, &[1]),
            Err(BridgeError::ArityMismatch { expected: 2, got: 1 })
        );
        assert_eq!(Arity::from_tag(3).unwrap().export_name(), "tether_call3");
        assert_eq!(Arity::from_tag(4), Err(BridgeError::UnknownArity(4)));
        c.release().unwrap();
    }
}
