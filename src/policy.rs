// Coordination policies: how concurrent `spawn_task` calls against the same
// step-function identity (plus an argument selector) interact.
//
// Grounded in the self-keeping task set and per-function policy slot this
// runtime's task engine is modeled on: a step function can be decorated
// with a policy so that repeated calls while one is already in flight
// queue, collapse, or supersede each other instead of running independently.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// How concurrent calls against the same policy key are coordinated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// No coordination: every call spawns an independent task.
    None,
    /// Calls queue: a new call only starts advancing once every earlier
    /// queued call for the same key has settled.
    Synchronized,
    /// At most one task per key runs at a time. A new call made while one
    /// is in flight is hand back the in-flight task's promise instead of
    /// spawning a second one.
    Singleton,
    /// Only the most recently spawned call for a key keeps running; a call
    /// it supersedes is cancelled before it can advance further.
    PassLast,
}

/// Identifies a policy slot: the step function's identity plus whatever the
/// caller's selector reduced this call's arguments to.
pub type PolicyKey = (&'static str, String);

type BoxedPromise = Arc<dyn Any + Send + Sync>;
type Waiter = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Slot {
    /// The promise of whichever task currently owns this slot, used by
    /// `Singleton` to hand out the same handle to later callers.
    current: Option<BoxedPromise>,
    /// Callers queued behind the current occupant under `Synchronized`.
    queue: Vec<Waiter>,
    /// The most recently spawned `PassLast` task for this key, handed to
    /// the next call as an extra input so it can sequence itself against
    /// its predecessor explicitly instead of the registry auto-cancelling
    /// it.
    last: Option<BoxedPromise>,
}

/// Process-wide table of policy slots, one per `(step_fn_name, selector)`.
#[derive(Default)]
pub struct PolicyRegistry {
    slots: Mutex<HashMap<PolicyKey, Slot>>,
}

/// What the caller should do as a result of registering against a slot.
pub enum Admission<P> {
    /// No conflicting occupant: proceed to spawn normally.
    Proceed,
    /// A `Singleton` slot already has an occupant; here is its promise.
    UseExisting(P),
    /// A `Synchronized` slot is occupied; the caller must wait for
    /// `release()` to be called on the returned key before advancing.
    Queued,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new call against `key` under `policy`. `PassLast` never
    /// blocks or auto-cancels here: a superseding call always proceeds and
    /// is expected to read [`take_last`] for the call it is replacing.
    ///
    /// [`take_last`]: PolicyRegistry::take_last
    pub fn admit<P>(&self, key: PolicyKey, policy: Policy, promise: P) -> Admission<P>
    where
        P: Clone + Send + Sync + 'static,
    {
        if matches!(policy, Policy::None | Policy::PassLast) {
            return Admission::Proceed;
        }
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(key).or_default();

        match policy {
            Policy::None | Policy::PassLast => Admission::Proceed,
            Policy::Singleton => {
                if let Some(existing) = &slot.current {
                    if let Some(existing) = existing.clone().downcast::<P>().ok() {
                        return Admission::UseExisting((*existing).clone());
                    }
                }
                slot.current = Some(Arc::new(promise));
                Admission::Proceed
            }
            Policy::Synchronized => {
                if slot.current.is_some() {
                    Admission::Queued
                } else {
                    slot.current = Some(Arc::new(promise));
                    Admission::Proceed
                }
            }
        }
    }

    /// Takes the `PassLast` occupant previously recorded for `key` via
    /// [`set_last`], handing it to a new call as an extra input instead of
    /// cancelling it automatically. Returns `None` if nothing is recorded
    /// yet, or if `P` doesn't match the type that was stored.
    ///
    /// [`set_last`]: PolicyRegistry::set_last
    pub fn take_last<P>(&self, key: &PolicyKey) -> Option<P>
    where
        P: Clone + Send + Sync + 'static,
    {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(key)?;
        let last = slot.last.take()?;
        last.downcast::<P>().ok().map(|p| (*p).clone())
    }

    /// Records `value` as the current `PassLast` occupant of `key`, to be
    /// handed to the call that next supersedes it.
    pub fn set_last<P>(&self, key: PolicyKey, value: P)
    where
        P: Send + Sync + 'static,
    {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(key).or_default();
        slot.last = Some(Arc::new(value));
    }

    /// Enqueues a `Synchronized` waiter to run once the current occupant
    /// releases the slot.
    pub fn enqueue(&self, key: &PolicyKey, waiter: Waiter) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(key) {
            slot.queue.push(waiter);
        } else {
            // Lost the race with a concurrent release; run immediately.
            waiter();
        }
    }

    /// Releases `key`: clears the current occupant and, for `Synchronized`
    /// slots, wakes the next queued waiter (which re-occupies the slot).
    pub fn release(&self, key: &PolicyKey) {
        let next = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get_mut(key) {
                Some(slot) if !slot.queue.is_empty() => {
                    let waiter = slot.queue.remove(0);
                    Some(waiter)
                }
                Some(slot) => {
                    slot.current = None;
                    None
                }
                None => None,
            }
        };
        if let Some(waiter) = next {
            waiter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn singleton_hands_back_existing_promise() {
        let reg = PolicyRegistry::new();
        let key: PolicyKey = ("job", "arg".to_string());
        let p1 = Arc::new(1_u32);
        let admission = reg.admit(key.clone(), Policy::Singleton, p1.clone());
        assert!(matches!(admission, Admission::Proceed));

        let p2 = Arc::new(2_u32);
        match reg.admit(key, Policy::Singleton, p2) {
            Admission::UseExisting(existing) => assert_eq!(*existing, 1),
            _ => panic!("expected UseExisting"),
        }
    }

    #[test]
    fn synchronized_queues_then_releases() {
        let reg = PolicyRegistry::new();
        let key: PolicyKey = ("job", "arg".to_string());
        assert!(matches!(
            reg.admit(key.clone(), Policy::Synchronized, Arc::new(())),
            Admission::Proceed
        ));
        assert!(matches!(
            reg.admit(key.clone(), Policy::Synchronized, Arc::new(())),
            Admission::Queued
        ));

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        reg.enqueue(&key, Box::new(move || { ran2.fetch_add(1, Ordering::SeqCst); }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        reg.release(&key);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pass_last_admits_without_blocking_or_cancelling() {
        let reg = PolicyRegistry::new();
        let key: PolicyKey = ("job", "arg".to_string());
        assert!(matches!(
            reg.admit(key.clone(), Policy::PassLast, Arc::new(())),
            Admission::Proceed
        ));
        assert!(matches!(
            reg.admit(key, Policy::PassLast, Arc::new(())),
            Admission::Proceed
        ));
    }

    #[test]
    fn pass_last_hands_previous_value_to_next_caller() {
        let reg = PolicyRegistry::new();
        let key: PolicyKey = ("job", "arg".to_string());

        assert!(reg.take_last::<u32>(&key).is_none());
        reg.set_last(key.clone(), 7_u32);
        assert_eq!(reg.take_last::<u32>(&key), Some(7));
        assert!(
            reg.take_last::<u32>(&key).is_none(),
            "take_last consumes the recorded value"
        );
    }
}
