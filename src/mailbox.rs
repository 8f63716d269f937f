//! Single-slot, overwrite-on-full mailbox used to hand a `RawFrame` from
//! a blocking driver thread to the main acquisition loop.

use std::sync::{Condvar, Mutex};

pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    signal: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Mailbox {
            slot: Mutex::new(None),
            signal: Condvar::new(),
        }
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a value, silently discarding whatever was left unread.
    pub fn publish(&self, value: T) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(value);
        self.signal.notify_one();
    }

    /// Non-blocking take: `None` if nothing has been published since
    /// the last take.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().unwrap().take()
    }

    /// Block up to `timeout` for a value to arrive.
    pub fn take_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        let slot = self.slot.lock().unwrap();
        if slot.is_some() {
            drop(slot);
            return self.try_take();
        }
        let (mut slot, _) = self.signal.wait_timeout(slot, timeout).unwrap();
        slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_on_full_keeps_only_latest() {
        let mb: Mailbox<i32> = Mailbox::new();
        mb.publish(1);
        mb.publish(2);
        assert_eq!(mb.try_take(), Some(2));
        assert_eq!(mb.try_take(), None);
    }
}
