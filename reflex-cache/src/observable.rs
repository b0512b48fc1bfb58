//! Reactive handles returned to consumers.
//!
//! An [`Observable`] keeps its interest subscribed for as long as it (or any
//! clone or derived value) is alive. [`Computed`] values are re-evaluated
//! lazily, only when read after one of their inputs changed.

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use reflex_core::{ReflexError, ReflexResult};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

use crate::registry::SubscriptionHandle;

type Retained = Arc<dyn Any + Send + Sync>;

/// Releases a subscription when dropped.
pub struct SubscriptionGuard<Id: Send + 'static> {
    handle: Option<SubscriptionHandle<Id>>,
    releases: mpsc::UnboundedSender<SubscriptionHandle<Id>>,
}

impl<Id: Send + 'static> SubscriptionGuard<Id> {
    pub(crate) fn new(
        handle: SubscriptionHandle<Id>,
        releases: mpsc::UnboundedSender<SubscriptionHandle<Id>>,
    ) -> Self {
        Self {
            handle: Some(handle),
            releases,
        }
    }
}

impl<Id: Send + 'static> Drop for SubscriptionGuard<Id> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // The cache is gone if the send fails; nothing left to release.
            let _ = self.releases.send(handle);
        }
    }
}

/// Live view of one cached value.
pub struct Observable<T> {
    rx: watch::Receiver<T>,
    retained: Vec<Retained>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            retained: self.retained.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.rx.borrow())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub(crate) fn with_guard<Id: Send + Sync + 'static>(
        rx: watch::Receiver<T>,
        guard: SubscriptionGuard<Id>,
    ) -> Self {
        let guard: Retained = Arc::new(guard);
        Self {
            rx,
            retained: vec![guard],
        }
    }

    /// Wrap a plain watch receiver.
    pub fn from_receiver(rx: watch::Receiver<T>) -> Self {
        Self {
            rx,
            retained: Vec::new(),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Whether a value arrived that [`changed`](Self::changed) has not returned yet.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Wait for the next value.
    pub async fn changed(&mut self) -> ReflexResult<T> {
        self.rx
            .changed()
            .await
            .map_err(|_| ReflexError::ShuttingDown)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until the value satisfies `predicate`, checking the current value first.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&T) -> bool) -> ReflexResult<T> {
        match self.rx.wait_for(predicate).await {
            Ok(value) => Ok(value.clone()),
            Err(_) => Err(ReflexError::ShuttingDown),
        }
    }

    /// Stream of values, starting with the current one.
    ///
    /// Intermediate values may be skipped when the consumer is slower than
    /// the producer; the latest value is always delivered.
    pub fn into_stream(self) -> ObservableStream<T> {
        ObservableStream {
            inner: WatchStream::new(self.rx),
            _retained: self.retained,
        }
    }

    /// Derived value recomputed from this observable on demand.
    pub fn map<U, F>(self, f: F) -> Computed<U>
    where
        F: Fn(&T) -> U + Send + 'static,
        U: 'static,
    {
        Computed::new(Box::new(Mapped { rx: self.rx, f }), self.retained)
    }

    /// Derived value over two observables.
    pub fn combine<B, U, F>(self, other: Observable<B>, f: F) -> Computed<U>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(&T, &B) -> U + Send + 'static,
        U: 'static,
    {
        let mut retained = self.retained;
        retained.extend(other.retained);
        Computed::new(
            Box::new(Combined {
                a: self.rx,
                b: other.rx,
                f,
            }),
            retained,
        )
    }
}

/// [`Stream`] over an observable's values.
pub struct ObservableStream<T> {
    inner: WatchStream<T>,
    _retained: Vec<Retained>,
}

impl<T: Clone + Send + Sync + 'static> Stream for ObservableStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

trait Source<T>: Send {
    fn is_dirty(&self) -> bool;
    fn compute(&mut self) -> T;
}

struct Mapped<A, F> {
    rx: watch::Receiver<A>,
    f: F,
}

impl<A, U, F> Source<U> for Mapped<A, F>
where
    A: Send + Sync,
    F: Fn(&A) -> U + Send,
{
    fn is_dirty(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    fn compute(&mut self) -> U {
        let value = self.rx.borrow_and_update();
        (self.f)(&value)
    }
}

struct Combined<A, B, F> {
    a: watch::Receiver<A>,
    b: watch::Receiver<B>,
    f: F,
}

impl<A, B, U, F> Source<U> for Combined<A, B, F>
where
    A: Send + Sync,
    B: Send + Sync,
    F: Fn(&A, &B) -> U + Send,
{
    fn is_dirty(&self) -> bool {
        self.a.has_changed().unwrap_or(false) || self.b.has_changed().unwrap_or(false)
    }

    fn compute(&mut self) -> U {
        let a = self.a.borrow_and_update();
        let b = self.b.borrow_and_update();
        (self.f)(&a, &b)
    }
}

/// Value derived from one or more observables.
///
/// Reading through [`get`](Self::get) recomputes only if an input changed
/// since the last evaluation.
pub struct Computed<T> {
    source: Box<dyn Source<T>>,
    value: T,
    evaluations: u64,
    _retained: Vec<Retained>,
}

impl<T> Computed<T> {
    fn new(mut source: Box<dyn Source<T>>, retained: Vec<Retained>) -> Self {
        let value = source.compute();
        Self {
            source,
            value,
            evaluations: 1,
            _retained: retained,
        }
    }

    pub fn get(&mut self) -> &T {
        if self.source.is_dirty() {
            self.value = self.source.compute();
            self.evaluations += 1;
        }
        &self.value
    }

    /// Last computed value, without checking the inputs.
    pub fn cached(&self) -> &T {
        &self.value
    }

    /// Whether an input changed since the last evaluation.
    pub fn is_stale(&self) -> bool {
        self.source.is_dirty()
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("value", &self.value)
            .field("evaluations", &self.evaluations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflex_core::InterestKey;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_changed_returns_new_value() {
        let (tx, rx) = watch::channel(1);
        let mut observable = Observable::from_receiver(rx);
        assert_eq!(observable.get(), 1);

        tx.send_replace(2);
        assert!(observable.has_changed());
        assert_eq!(observable.changed().await, Ok(2));
        assert!(!observable.has_changed());
    }

    #[tokio::test]
    async fn test_closed_source_reports_shutdown() {
        let (tx, rx) = watch::channel(1);
        let mut observable = Observable::from_receiver(rx);
        drop(tx);
        assert_eq!(observable.changed().await, Err(ReflexError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_computed_is_lazy() {
        let (tx, rx) = watch::channel(2);
        let mut doubled = Observable::from_receiver(rx).map(|v| v * 2);
        assert_eq!(*doubled.get(), 4);
        assert_eq!(*doubled.get(), 4);
        assert_eq!(doubled.evaluations(), 1);

        tx.send_replace(3);
        tx.send_replace(5);
        assert!(doubled.is_stale());
        assert_eq!(*doubled.cached(), 4);
        assert_eq!(*doubled.get(), 10);
        assert_eq!(doubled.evaluations(), 2);
    }

    #[tokio::test]
    async fn test_combine() {
        let (tx_a, a) = watch::channel(1);
        let (_tx_b, b) = watch::channel(10);
        let mut sum = Observable::from_receiver(a).combine(Observable::from_receiver(b), |a, b| a + b);
        assert_eq!(*sum.get(), 11);

        tx_a.send_replace(5);
        assert_eq!(*sum.get(), 15);
        assert_eq!(sum.evaluations(), 2);
    }

    #[tokio::test]
    async fn test_stream_starts_with_current_value() {
        let (tx, rx) = watch::channel("a");
        let mut stream = Observable::from_receiver(rx).into_stream();
        assert_eq!(stream.next().await, Some("a"));
        tx.send_replace("b");
        assert_eq!(stream.next().await, Some("b"));
        drop(tx);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_guard_released_with_last_clone() {
        let (release_tx, mut release_rx) = mpsc::unbounded_channel();
        let mut registry = crate::registry::SubscriptionRegistry::new();
        let (handle, _) = registry.acquire(InterestKey::Item("U1".to_string()));

        let (_tx, rx) = watch::channel(0);
        let observable = Observable::with_guard(rx, SubscriptionGuard::new(handle, release_tx));
        let derived = observable.clone().map(|v| v + 1);

        drop(observable);
        assert!(release_rx.try_recv().is_err());
        drop(derived);
        let released = release_rx.try_recv().unwrap();
        assert_eq!(released.key(), &InterestKey::Item("U1".to_string()));
    }
}
