use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

type TeardownAction = Box<dyn FnOnce() + Send>;

/// Scoped-disposal gate shared by every disposable object in the engine.
///
/// A disposal flag is checked both outside and inside the lock, so an
/// operation racing a concurrent `dispose` either runs completely before
/// teardown starts or not at all. Attached teardown actions execute exactly
/// once, on the first successful `dispose`, in attach order.
pub(crate) struct DisposalGate {
    disposed: AtomicBool,
    actions: Mutex<Vec<TeardownAction>>,
}

impl DisposalGate {
    pub(crate) fn new() -> Self {
        Self {
            disposed: AtomicBool::new(false),
            actions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Attach a teardown action. If the gate is already disposed the action
    /// runs immediately on the calling thread.
    pub(crate) fn attach(&self, action: impl FnOnce() + Send + 'static) {
        if self.is_disposed() {
            action();
            return;
        }
        let mut actions = self.actions.lock();
        if self.is_disposed() {
            drop(actions);
            action();
        } else {
            actions.push(Box::new(action));
        }
    }

    /// Run `operation` unless disposal has begun. Returns `None` when the
    /// gate is closed. The gate's lock is held while the operation runs, so
    /// disposal cannot start mid-operation.
    pub(crate) fn run<R>(&self, operation: impl FnOnce() -> R) -> Option<R> {
        if self.is_disposed() {
            return None;
        }
        let _actions = self.actions.lock();
        if self.is_disposed() {
            return None;
        }
        Some(operation())
    }

    /// Close the gate and execute all attached teardown actions. Safe to
    /// call concurrently and repeatedly; only the first call tears down.
    /// Returns whether this call performed the disposal.
    pub(crate) fn dispose(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        let drained = {
            let mut actions = self.actions.lock();
            if self.is_disposed() {
                return false;
            }
            self.disposed.store(true, Ordering::Release);
            std::mem::take(&mut *actions)
        };
        for action in drained {
            action();
        }
        true
    }
}

impl Default for DisposalGate {
    fn default() -> Self {
        Self::new()
    }
}
