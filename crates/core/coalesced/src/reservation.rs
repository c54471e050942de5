use std::{fmt, future::Future, sync::Arc};

use futures::future::{BoxFuture, FutureExt};

use crate::Error;

type OperationFn<A> = dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync;
type SuccessFn<A> = dyn Fn(&Reservation<A>) + Send + Sync;
type FailureFn<A> = dyn Fn(&Reservation<A>, &Error) + Send + Sync;

/// Transport call dispatched for a reservation.
///
/// The coalescer never looks at what the call produces, only at when the
/// returned future resolves (see [`crate::Release`]).
pub struct Operation<A> {
    inner: Arc<OperationFn<A>>,
}

impl<A: 'static> Operation<A> {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |arguments| func(arguments).boxed()),
        }
    }

    /// Start the call, the returned future drives it to completion.
    pub fn call(&self, arguments: A) -> BoxFuture<'static, ()> {
        (self.inner)(arguments)
    }

    /// Whether both handles refer to the same underlying call.
    pub fn same_as(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inner) as *const (),
            Arc::as_ptr(&other.inner) as *const (),
        )
    }
}

impl<A> Clone for Operation<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> fmt::Debug for Operation<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({:p})", Arc::as_ptr(&self.inner) as *const ())
    }
}

/// Optional pair of completion callbacks attached to a reservation.
pub struct Callbacks<A> {
    on_success: Option<Arc<SuccessFn<A>>>,
    on_failure: Option<Arc<FailureFn<A>>>,
}

impl<A> Callbacks<A> {
    pub fn new() -> Self {
        Self {
            on_success: None,
            on_failure: None,
        }
    }

    /// Called right after the reservation has been dispatched.
    pub fn on_success<F>(mut self, func: F) -> Self
    where
        F: Fn(&Reservation<A>) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(func));
        self
    }

    /// Called when the reservation timed out waiting for the transport.
    pub fn on_failure<F>(mut self, func: F) -> Self
    where
        F: Fn(&Reservation<A>, &Error) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(func));
        self
    }

    pub fn has_success(&self) -> bool {
        self.on_success.is_some()
    }

    pub fn has_failure(&self) -> bool {
        self.on_failure.is_some()
    }
}

impl<A> Default for Callbacks<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for Callbacks<A> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
        }
    }
}

impl<A> fmt::Debug for Callbacks<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_success", &self.has_success())
            .field("on_failure", &self.has_failure())
            .finish()
    }
}

#[derive(Clone, Debug)]
/// Stored intent to perform one coalesced call.
pub struct Reservation<A> {
    pub operation: Operation<A>,
    pub arguments: A,
    pub callbacks: Callbacks<A>,
}

impl<A> Reservation<A> {
    pub fn new(operation: Operation<A>, arguments: A, callbacks: Callbacks<A>) -> Self {
        Self {
            operation,
            arguments,
            callbacks,
        }
    }

    /// Invoke whichever callbacks apply.
    ///
    /// The failure callback only runs when `failure` is set; it receives the
    /// reason alongside the reservation.
    pub(crate) fn notify(&self, failure: Option<&Error>) {
        if let Some(on_success) = &self.callbacks.on_success {
            if failure.is_none() {
                on_success(self);
            }
        }

        if let (Some(on_failure), Some(error)) = (&self.callbacks.on_failure, failure) {
            on_failure(self, error);
        }
    }
}
