//! Change notification.
//!
//! An observer list of `(accessor, last-seen value, callback)` tuples.
//! Every store mutation fires one pass: each subscriber recomputes its
//! value through the accessor, deep-compares it with the value cached
//! from the previous pass, and only on inequality invokes its callback
//! with `(new, old)`. Scoped and whole-document subscriptions differ only
//! in the accessor they install.

use std::collections::HashSet;

use serde_json::{Map, Value};

/// Callback invoked with `(new, old)` when a watched value changes.
/// `None` means "absent" on either side.
pub type ChangeCallback = Box<dyn FnMut(Option<&Value>, Option<&Value>) + Send>;

/// Reads the watched value out of the current document.
pub type Accessor = Box<dyn Fn(&Map<String, Value>) -> Option<Value> + Send>;

/// Handle returned by a subscription; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

pub(crate) struct Subscriber {
    id: u64,
    accessor: Accessor,
    last: Option<Value>,
    callback: ChangeCallback,
}

/// The observer list. Owned by the store behind its own lock, but the
/// notification pass itself runs with the lock released: the caller takes
/// the subscribers out with [`ChangeBus::begin_notify`], runs
/// [`run_pass`] unlocked, and merges them back with
/// [`ChangeBus::finish_notify`]. Callbacks may therefore subscribe,
/// unsubscribe, and call any store operation without deadlocking.
#[derive(Default)]
pub(crate) struct ChangeBus {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    /// Ids currently out on a notification pass.
    detached: HashSet<u64>,
    /// Detached ids unsubscribed mid-pass; dropped at merge time.
    removed: HashSet<u64>,
}

impl ChangeBus {
    pub(crate) fn subscribe(
        &mut self,
        accessor: Accessor,
        current: Option<Value>,
        callback: ChangeCallback,
    ) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            accessor,
            last: current,
            callback,
        });
        Subscription(id)
    }

    /// Remove a listener; returns whether it was still registered. A
    /// listener that is out on a pass is tombstoned instead and dropped
    /// when the pass merges back.
    pub(crate) fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|sub| sub.id != subscription.0);
        if before != self.subscribers.len() {
            return true;
        }
        if self.detached.remove(&subscription.0) {
            self.removed.insert(subscription.0);
            return true;
        }
        false
    }

    /// Take the subscriber list out for an unlocked notification pass.
    pub(crate) fn begin_notify(&mut self) -> Vec<Subscriber> {
        for sub in &self.subscribers {
            self.detached.insert(sub.id);
        }
        std::mem::take(&mut self.subscribers)
    }

    /// Merge a pass back, honoring mid-pass unsubscribes and keeping any
    /// listeners subscribed while the pass ran.
    pub(crate) fn finish_notify(&mut self, mut passed: Vec<Subscriber>) {
        passed.retain(|sub| {
            self.detached.remove(&sub.id);
            !self.removed.remove(&sub.id)
        });
        let added = std::mem::take(&mut self.subscribers);
        self.subscribers = passed;
        self.subscribers.extend(added);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.subscribers.len()
    }
}

/// One notification pass over the current document. Runs without any bus
/// lock held; see [`ChangeBus::begin_notify`].
pub(crate) fn run_pass(subscribers: &mut [Subscriber], doc: &Map<String, Value>) {
    for sub in subscribers {
        let now = (sub.accessor)(doc);
        if now != sub.last {
            (sub.callback)(now.as_ref(), sub.last.as_ref());
            sub.last = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn key_accessor(key: &str) -> Accessor {
        let key = key.to_owned();
        Box::new(move |doc| doc.get(&key).cloned())
    }

    fn notify(bus: &mut ChangeBus, doc: &Map<String, Value>) {
        let mut pass = bus.begin_notify();
        run_pass(&mut pass, doc);
        bus.finish_notify(pass);
    }

    #[test]
    fn fires_only_on_inequality() {
        let mut bus = ChangeBus::default();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        bus.subscribe(
            key_accessor("theme"),
            None,
            Box::new(move |new, old| {
                sink.lock()
                    .unwrap()
                    .push((new.cloned(), old.cloned()));
            }),
        );

        let mut doc = Map::new();
        doc.insert("theme".into(), json!("dark"));
        notify(&mut bus, &doc);
        notify(&mut bus, &doc); // unchanged, must not fire again
        doc.insert("theme".into(), json!("light"));
        notify(&mut bus, &doc);

        let events = fired.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                (Some(json!("dark")), None),
                (Some(json!("light")), Some(json!("dark"))),
            ]
        );
    }

    #[test]
    fn deletion_fires_with_old_value() {
        let mut bus = ChangeBus::default();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        bus.subscribe(
            key_accessor("a"),
            Some(json!(1)),
            Box::new(move |new, old| {
                sink.lock()
                    .unwrap()
                    .push((new.cloned(), old.cloned()));
            }),
        );
        notify(&mut bus, &Map::new());
        assert_eq!(*fired.lock().unwrap(), vec![(None, Some(json!(1)))]);
    }

    #[test]
    fn unsubscribed_listeners_stop_comparing() {
        let mut bus = ChangeBus::default();
        let fired = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&fired);
        let sub = bus.subscribe(
            key_accessor("a"),
            None,
            Box::new(move |_, _| *sink.lock().unwrap() += 1),
        );
        assert!(bus.unsubscribe(sub));
        assert!(!bus.unsubscribe(sub));
        assert_eq!(bus.len(), 0);

        let mut doc = Map::new();
        doc.insert("a".into(), json!(5));
        notify(&mut bus, &doc);
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn mid_pass_unsubscribe_is_honored_at_merge() {
        let mut bus = ChangeBus::default();
        let sub = bus.subscribe(key_accessor("a"), None, Box::new(|_, _| {}));

        let pass = bus.begin_notify();
        // What a callback calling `unsubscribe` does while the list is out.
        assert!(bus.unsubscribe(sub));
        assert!(!bus.unsubscribe(sub));
        bus.finish_notify(pass);
        assert_eq!(bus.len(), 0);
    }

    #[test]
    fn mid_pass_subscribe_survives_the_merge() {
        let mut bus = ChangeBus::default();
        bus.subscribe(key_accessor("a"), None, Box::new(|_, _| {}));

        let pass = bus.begin_notify();
        bus.subscribe(key_accessor("b"), None, Box::new(|_, _| {}));
        bus.finish_notify(pass);
        assert_eq!(bus.len(), 2);
    }
}
