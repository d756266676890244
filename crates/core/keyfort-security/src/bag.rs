use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// A bounded blocking bag of reusable items.
///
/// Items are handed out with [`Bag::borrow`] and must be given back with
/// [`Bag::requite`]. The bag never creates items itself; whatever was put in
/// at construction (plus anything requited later) is all there is, which
/// bounds the parallelism of every consumer to the initial population.
pub struct Bag<T> {
    idle: Mutex<VecDeque<T>>,
    returned: Condvar,
}

impl<T> Bag<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            idle: Mutex::new(items.into_iter().collect()),
            returned: Condvar::new(),
        }
    }

    /// Takes an item, waiting up to `timeout` for one to be requited.
    ///
    /// Returns `None` when the deadline passes with the bag still empty.
    pub fn borrow(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut idle = self.idle.lock().unwrap();
        loop {
            if let Some(item) = idle.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.returned.wait_timeout(idle, deadline - now).unwrap();
            idle = guard;
        }
    }

    /// Takes an item only if one is idle right now.
    pub fn try_borrow(&self) -> Option<T> {
        self.idle.lock().unwrap().pop_front()
    }

    /// Gives an item back and wakes one waiter.
    pub fn requite(&self, item: T) {
        self.idle.lock().unwrap().push_back(item);
        self.returned.notify_one();
    }

    /// Number of items currently idle in the bag.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn borrow_and_requite_round_trip() {
        let bag = Bag::new([1, 2]);
        let a = bag.borrow(Duration::from_millis(10)).unwrap();
        let b = bag.borrow(Duration::from_millis(10)).unwrap();
        assert!(bag.borrow(Duration::from_millis(20)).is_none());
        bag.requite(a);
        bag.requite(b);
        assert_eq!(bag.idle_count(), 2);
    }

    #[test]
    fn waiter_wakes_on_requite() {
        let bag = Arc::new(Bag::new([0u8]));
        let item = bag.borrow(Duration::ZERO).unwrap();

        let waiter = {
            let bag = Arc::clone(&bag);
            std::thread::spawn(move || bag.borrow(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(50));
        bag.requite(item);
        assert_eq!(waiter.join().unwrap(), Some(0u8));
    }
}
