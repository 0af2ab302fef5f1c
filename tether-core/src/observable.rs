//! Minimal push-based, cancelable stream primitive.
//!
//! Every async result in the pipeline flows through an [`Observable`]: links
//! return them, terminal transports feed them, and the client facade awaits
//! them. The contract is deliberately small: any number of `next` emissions
//! followed by at most one terminal event (`error` or `complete`), and an
//! unsubscribe handle that halts the producer's side effects at most once.

use std::sync::{Arc, Mutex};

/// Producer cleanup, invoked at most once on terminal event or unsubscribe.
pub type Teardown = Box<dyn FnOnce() + Send>;

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn<E> = Box<dyn FnMut(E) + Send>;
type CompleteFn = Box<dyn FnMut() + Send>;

/// Callbacks for one subscription. All three are optional.
pub struct Observer<T, E> {
    next: Option<NextFn<T>>,
    error: Option<ErrorFn<E>>,
    complete: Option<CompleteFn>,
}

impl<T, E> Default for Observer<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Observer<T, E> {
    pub fn new() -> Self {
        Observer {
            next: None,
            error: None,
            complete: None,
        }
    }

    pub fn on_next(mut self, f: impl FnMut(T) + Send + 'static) -> Self {
        self.next = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(E) + Send + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

struct SubscriptionState<T, E> {
    observer: Option<Observer<T, E>>,
    done: bool,
    teardown: Option<Teardown>,
}

impl<T, E> SubscriptionState<T, E> {
    fn new(observer: Observer<T, E>) -> Self {
        SubscriptionState {
            observer: Some(observer),
            done: false,
            teardown: None,
        }
    }
}

/// The producer-facing half of a subscription.
///
/// Enforces the terminal-once invariant: `next` after `error`/`complete` is a
/// no-op, and the teardown runs at most once no matter how delivery ends.
pub struct Subscriber<T, E> {
    state: Arc<Mutex<SubscriptionState<T, E>>>,
}

impl<T, E> Clone for Subscriber<T, E> {
    fn clone(&self) -> Self {
        Subscriber {
            state: self.state.clone(),
        }
    }
}

impl<T, E> Subscriber<T, E> {
    /// Deliver a value. No-op once a terminal event has fired.
    pub fn next(&self, value: T) {
        // Callbacks run outside the lock so they may re-enter (e.g. an
        // observer that unsubscribes from within `next`).
        let mut observer = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(p) => p.into_inner(),
            };
            if state.done {
                return;
            }
            match state.observer.take() {
                Some(o) => o,
                None => return,
            }
        };
        if let Some(next) = observer.next.as_mut() {
            next(value);
        }
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        if !state.done && state.observer.is_none() {
            state.observer = Some(observer);
        }
    }

    /// Deliver the error terminal event and run the teardown.
    pub fn error(&self, err: E) {
        let (observer, teardown) = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(p) => p.into_inner(),
            };
            if state.done {
                return;
            }
            state.done = true;
            (state.observer.take(), state.teardown.take())
        };
        if let Some(mut observer) = observer {
            if let Some(error) = observer.error.as_mut() {
                error(err);
            }
        }
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// Deliver the completion terminal event and run the teardown.
    pub fn complete(&self) {
        let (observer, teardown) = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(p) => p.into_inner(),
            };
            if state.done {
                return;
            }
            state.done = true;
            (state.observer.take(), state.teardown.take())
        };
        if let Some(mut observer) = observer {
            if let Some(complete) = observer.complete.as_mut() {
                complete();
            }
        }
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// True once a terminal event fired or the subscriber unsubscribed.
    pub fn is_closed(&self) -> bool {
        match self.state.lock() {
            Ok(s) => s.done,
            Err(p) => p.into_inner().done,
        }
    }
}

/// Unsubscribe handle returned by [`Observable::subscribe`].
#[derive(Clone)]
pub struct Subscription {
    unsub: Arc<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription")
    }
}

impl Subscription {
    /// Stop delivery and run the producer's teardown at most once.
    pub fn unsubscribe(&self) {
        (self.unsub)();
    }
}

/// Builds a standalone subscription handle that runs `cleanup` at most once.
pub fn subscription_from(cleanup: impl FnOnce() + Send + 'static) -> Subscription {
    let slot: Mutex<Option<Box<dyn FnOnce() + Send>>> = Mutex::new(Some(Box::new(cleanup)));
    Subscription {
        unsub: Arc::new(move || {
            let cleanup = match slot.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(cleanup) = cleanup {
                cleanup();
            }
        }),
    }
}

/// A cold push stream: the producer closure runs once per subscribe.
///
/// A producer returning `Err` becomes an `error` event on the observer; no
/// failure crosses the subscribe boundary directly.
pub struct Observable<T, E> {
    producer: Arc<dyn Fn(Subscriber<T, E>) -> Result<Teardown, E> + Send + Sync>,
}

impl<T, E> Clone for Observable<T, E> {
    fn clone(&self) -> Self {
        Observable {
            producer: self.producer.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for Observable<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Observable")
    }
}

impl<T, E> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new(
        producer: impl Fn(Subscriber<T, E>) -> Result<Teardown, E> + Send + Sync + 'static,
    ) -> Self {
        Observable {
            producer: Arc::new(producer),
        }
    }

    /// Emits one value, then completes.
    pub fn of(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Observable::new(move |subscriber| {
            subscriber.next(value.clone());
            subscriber.complete();
            Ok(Box::new(|| {}) as Teardown)
        })
    }

    /// Terminates immediately with the given error.
    pub fn throw(err: E) -> Self
    where
        E: Clone + Sync,
    {
        Observable::new(move |_subscriber| Err(err.clone()))
    }

    /// Completes immediately without emitting.
    pub fn empty() -> Self {
        Observable::new(|subscriber| {
            subscriber.complete();
            Ok(Box::new(|| {}) as Teardown)
        })
    }

    pub fn subscribe(&self, observer: Observer<T, E>) -> Subscription {
        let state = Arc::new(Mutex::new(SubscriptionState::new(observer)));
        let subscriber = Subscriber {
            state: state.clone(),
        };

        match (self.producer)(subscriber.clone()) {
            Ok(teardown) => {
                // The producer may have terminated synchronously before
                // handing us its teardown; run it now in that case.
                let mut teardown = Some(teardown);
                let run_now = {
                    let mut state = match state.lock() {
                        Ok(s) => s,
                        Err(p) => p.into_inner(),
                    };
                    if state.done {
                        teardown.take()
                    } else {
                        state.teardown = teardown.take();
                        None
                    }
                };
                if let Some(teardown) = run_now {
                    teardown();
                }
            }
            Err(err) => subscriber.error(err),
        }

        let unsub_state = state;
        Subscription {
            unsub: Arc::new(move || {
                let teardown = {
                    let mut state = match unsub_state.lock() {
                        Ok(s) => s,
                        Err(p) => p.into_inner(),
                    };
                    state.done = true;
                    state.observer = None;
                    state.teardown.take()
                };
                if let Some(teardown) = teardown {
                    teardown();
                }
            }),
        }
    }

    /// Ref-counts subscribers onto one underlying subscription.
    ///
    /// The source is subscribed when the first observer arrives and torn down
    /// when the last one leaves; after termination the next subscribe starts
    /// a fresh producer.
    pub fn share(self) -> Observable<T, E>
    where
        T: Clone,
        E: Clone,
    {
        let inner = Arc::new(ShareInner {
            source: self,
            state: Mutex::new(ShareState {
                next_id: 0,
                subscribers: Vec::new(),
                source_sub: None,
            }),
        });

        Observable::new(move |subscriber| {
            let inner = inner.clone();
            let (id, connect) = {
                let mut state = lock(&inner.state);
                let id = state.next_id;
                state.next_id += 1;
                state.subscribers.push((id, subscriber));
                (id, state.source_sub.is_none() && state.subscribers.len() == 1)
            };

            if connect {
                let fanout = inner.clone();
                let fanout_err = inner.clone();
                let fanout_done = inner.clone();
                let observer = Observer::new()
                    .on_next(move |value: T| {
                        let subs: Vec<Subscriber<T, E>> = lock(&fanout.state)
                            .subscribers
                            .iter()
                            .map(|(_, s)| s.clone())
                            .collect();
                        for sub in subs {
                            sub.next(value.clone());
                        }
                    })
                    .on_error(move |err: E| {
                        let subs = {
                            let mut state = lock(&fanout_err.state);
                            state.source_sub = None;
                            std::mem::take(&mut state.subscribers)
                        };
                        for (_, sub) in subs {
                            sub.error(err.clone());
                        }
                    })
                    .on_complete(move || {
                        let subs = {
                            let mut state = lock(&fanout_done.state);
                            state.source_sub = None;
                            std::mem::take(&mut state.subscribers)
                        };
                        for (_, sub) in subs {
                            sub.complete();
                        }
                    });
                let sub = inner.source.subscribe(observer);
                let mut state = lock(&inner.state);
                if state.subscribers.is_empty() {
                    // Source terminated synchronously while connecting.
                    drop(state);
                    sub.unsubscribe();
                } else {
                    state.source_sub = Some(sub);
                }
            }

            let teardown_inner = inner;
            Ok(Box::new(move || {
                let source_sub = {
                    let mut state = lock(&teardown_inner.state);
                    state.subscribers.retain(|(sid, _)| *sid != id);
                    if state.subscribers.is_empty() {
                        state.source_sub.take()
                    } else {
                        None
                    }
                };
                if let Some(sub) = source_sub {
                    sub.unsubscribe();
                }
            }) as Teardown)
        })
    }
}

struct ShareInner<T, E> {
    source: Observable<T, E>,
    state: Mutex<ShareState<T, E>>,
}

struct ShareState<T, E> {
    next_id: u64,
    subscribers: Vec<(u64, Subscriber<T, E>)>,
    source_sub: Option<Subscription>,
}

fn lock<S>(mutex: &Mutex<S>) -> std::sync::MutexGuard<'_, S> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Awaits the first `next` emission.
///
/// Returns `None` when the observable completes without emitting. The
/// subscription is dropped as soon as the first value arrives.
pub async fn first_value<T, E>(observable: &Observable<T, E>) -> Option<Result<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel::<Option<Result<T, E>>>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let tx_next = tx.clone();
    let tx_err = tx.clone();
    let tx_done = tx.clone();

    let subscription = observable.subscribe(
        Observer::new()
            .on_next(move |value| {
                if let Some(tx) = lock(&tx_next).take() {
                    let _ = tx.send(Some(Ok(value)));
                }
            })
            .on_error(move |err| {
                if let Some(tx) = lock(&tx_err).take() {
                    let _ = tx.send(Some(Err(err)));
                }
            })
            .on_complete(move || {
                if let Some(tx) = lock(&tx_done).take() {
                    let _ = tx.send(None);
                }
            }),
    );

    let result = rx.await.ok().flatten();
    subscription.unsubscribe();
    result
}
