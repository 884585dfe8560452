//! Cross-thread interruption of a running evaluation.
//!
//! An [`EvalBreaker`] is shared (via `Arc`) between the evaluating thread and any
//! number of other threads. Those threads can queue callbacks to run on the
//! evaluating thread, or post an exception to be raised there. Both set a single
//! atomic flag; the evaluation loop only inspects the queues when the flag is up.
//!
//! The loop services the breaker between instructions, except when the next
//! instruction is one of `SETUP_FINALLY`, `SETUP_WITH`, `BEFORE_ASYNC_WITH` or
//! `YIELD_FROM`. Deferring there keeps an interrupt from landing between acquiring
//! a resource and registering its cleanup block.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::exception_private::{ExcType, RunResult, SimpleException};

/// A callback queued to run on the evaluating thread.
///
/// Returning `Err` raises an exception of that class at the current instruction.
pub type PendingCall = Box<dyn FnOnce() -> Result<(), ExcType> + Send>;

/// Flag plus queues for asynchronous requests to an evaluation loop.
#[derive(Default)]
pub struct EvalBreaker {
    requested: AtomicBool,
    pending: Mutex<VecDeque<PendingCall>>,
    async_exc: Mutex<Option<ExcType>>,
}

impl fmt::Debug for EvalBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalBreaker")
            .field("requested", &self.requested.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EvalBreaker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag without queuing work; the next safe point services nothing.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Queues `call` to run on the evaluating thread at the next safe point.
    pub fn add_pending_call(&self, call: PendingCall) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).push_back(call);
        self.requested.store(true, Ordering::Release);
    }

    /// Asks the evaluating thread to raise `exc_type` at the next safe point,
    /// typically `KeyboardInterrupt`.
    ///
    /// A later request replaces an earlier one that has not been delivered yet.
    pub fn interrupt(&self, exc_type: ExcType) {
        *self.async_exc.lock().unwrap_or_else(PoisonError::into_inner) = Some(exc_type);
        self.requested.store(true, Ordering::Release);
    }

    /// Cheap check performed by the evaluation loop before every instruction.
    #[inline]
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// Runs queued callbacks, then delivers a posted exception.
    ///
    /// The first failing callback stops servicing; the remaining work stays queued
    /// and the flag stays up so it is handled at the next safe point.
    pub(crate) fn service(&self) -> RunResult<()> {
        self.requested.store(false, Ordering::Release);
        loop {
            let call = self.pending.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            let Some(call) = call else { break };
            if let Err(exc_type) = call() {
                self.rearm();
                return Err(SimpleException::new_none(exc_type).into());
            }
        }
        let exc = self.async_exc.lock().unwrap_or_else(PoisonError::into_inner).take();
        match exc {
            Some(exc_type) => Err(SimpleException::new_none(exc_type).into()),
            None => Ok(()),
        }
    }

    fn rearm(&self) {
        let has_calls = !self.pending.lock().unwrap_or_else(PoisonError::into_inner).is_empty();
        let has_exc = self.async_exc.lock().unwrap_or_else(PoisonError::into_inner).is_some();
        if has_calls || has_exc {
            self.requested.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{exception_private::RunError, heap::Heap, resource::NoLimitTracker};

    #[test]
    fn pending_calls_run_in_order_then_exception() {
        let breaker = EvalBreaker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for expected in 0..3 {
            let counter = Arc::clone(&counter);
            breaker.add_pending_call(Box::new(move || {
                assert_eq!(counter.fetch_add(1, Ordering::SeqCst), expected);
                Ok(())
            }));
        }
        breaker.interrupt(ExcType::KeyboardInterrupt);
        assert!(breaker.is_requested());
        let err = breaker.service().unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        let heap = Heap::new(0, NoLimitTracker);
        assert_eq!(err.exc_type(&heap), Some(ExcType::KeyboardInterrupt));
        assert!(!breaker.is_requested());
        assert!(breaker.service().is_ok());
    }

    #[test]
    fn failing_call_keeps_rest_queued() {
        let breaker = EvalBreaker::new();
        breaker.add_pending_call(Box::new(|| Err(ExcType::ValueError)));
        breaker.add_pending_call(Box::new(|| Ok(())));
        let err = breaker.service().unwrap_err();
        assert!(matches!(err, RunError::Exc(_)));
        assert!(breaker.is_requested());
        assert!(breaker.service().is_ok());
        assert!(!breaker.is_requested());
    }

    #[test]
    fn bare_request_services_cleanly() {
        let breaker = EvalBreaker::new();
        breaker.request();
        assert!(breaker.is_requested());
        assert!(breaker.service().is_ok());
        assert!(!breaker.is_requested());
    }
}
