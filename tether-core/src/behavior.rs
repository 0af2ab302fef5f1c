//! Behavior variant of the observable: replays the latest value.

use std::sync::{Arc, Mutex};

use crate::observable::Subscription;

type ObserverFn<T> = Box<dyn FnMut(T) + Send>;

struct BehaviorInner<T> {
    value: T,
    next_id: u64,
    observers: Vec<(u64, ObserverFn<T>)>,
}

/// Holds a current value, replays it synchronously to new subscribers, and
/// pushes every update to all of them. Used for connection-state tracking.
pub struct BehaviorSubject<T> {
    inner: Arc<Mutex<BehaviorInner<T>>>,
}

impl<T> Clone for BehaviorSubject<T> {
    fn clone(&self) -> Self {
        BehaviorSubject {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for BehaviorSubject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BehaviorSubject")
    }
}

impl<T: Clone + Send + 'static> BehaviorSubject<T> {
    pub fn new(initial: T) -> Self {
        BehaviorSubject {
            inner: Arc::new(Mutex::new(BehaviorInner {
                value: initial,
                next_id: 0,
                observers: Vec::new(),
            })),
        }
    }

    /// Synchronous getter for the latest value.
    pub fn get(&self) -> T {
        lock(&self.inner).value.clone()
    }

    /// Push a new value to every subscriber.
    pub fn next(&self, value: T) {
        let mut observers = {
            let mut inner = lock(&self.inner);
            inner.value = value.clone();
            // Callbacks run outside the lock; observers added mid-push see
            // the value via replay instead.
            std::mem::take(&mut inner.observers)
        };
        for (_, observer) in observers.iter_mut() {
            observer(value.clone());
        }
        let mut inner = lock(&self.inner);
        observers.extend(std::mem::take(&mut inner.observers));
        inner.observers = observers;
    }

    /// Subscribe with immediate synchronous replay of the current value.
    pub fn subscribe(&self, mut observer: impl FnMut(T) + Send + 'static) -> Subscription {
        let (id, current) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            (id, inner.value.clone())
        };
        observer(current);
        lock(&self.inner).observers.push((id, Box::new(observer)));

        let inner = self.inner.clone();
        crate::observable::subscription_from(move || {
            lock(&inner).observers.retain(|(oid, _)| *oid != id);
        })
    }
}

fn lock<T>(mutex: &Mutex<BehaviorInner<T>>) -> std::sync::MutexGuard<'_, BehaviorInner<T>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_latest_value_synchronously() {
        let subject = BehaviorSubject::new(1);
        subject.next(2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = subject.subscribe(move |v| match seen2.lock() {
            Ok(mut s) => s.push(v),
            Err(p) => p.into_inner().push(v),
        });

        assert_eq!(*seen.lock().unwrap(), vec![2]);
        subject.next(3);
        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
        assert_eq!(subject.get(), 3);
    }

    #[test]
    fn unsubscribe_stops_updates() {
        let subject = BehaviorSubject::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sub = subject.subscribe(move |v| seen2.lock().unwrap().push(v));
        sub.unsubscribe();
        subject.next(5);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert_eq!(subject.get(), 5);
    }
}
