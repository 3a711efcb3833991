//! Message queues
//!
//! A thin, non-blocking wrapper around a bounded FIFO carrying opaque
//! message pointers. The kernel never dereferences a message.
use alloc::collections::VecDeque;

use crate::error::{fatal, Error};
use crate::klock;
use crate::state::Kcb;

/// An opaque message pointer. Ownership conventions are between the
/// producer and the consumer; the kernel only stores the value.
pub type Message = *mut ();

/// *Message queue control block*.
pub(crate) struct MqCb {
    pub(crate) gen: u16,
    pub(crate) queue: VecDeque<Message>,
    pub(crate) cap: usize,
}

/// Handle to a message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQueue {
    slot: u16,
    gen: u16,
}

impl Kcb {
    fn mq_cb(&mut self, mq: MessageQueue) -> &mut MqCb {
        match self.mqueues.get_mut(mq.slot as usize) {
            Some(cb) if cb.gen == mq.gen => cb,
            _ => fatal(Error::Unknown, "operation on an invalid message queue"),
        }
    }

    pub(crate) fn mq_create(&mut self, capacity: u16) -> Result<MessageQueue, Error> {
        if capacity == 0 {
            return Err(Error::Fail);
        }
        let gen = self.alloc_gen();
        let slot = self.mqueues.insert(MqCb {
            gen,
            queue: VecDeque::with_capacity(capacity as usize),
            cap: capacity as usize,
        });
        Ok(MessageQueue {
            slot: slot as u16,
            gen,
        })
    }

    pub(crate) fn mq_enqueue(&mut self, mq: MessageQueue, msg: Message) -> Result<(), Error> {
        let cb = self.mq_cb(mq);
        if cb.queue.len() >= cb.cap {
            return Err(Error::TaskBusy);
        }
        cb.queue.push_back(msg);
        Ok(())
    }

    pub(crate) fn mq_dequeue(&mut self, mq: MessageQueue) -> Option<Message> {
        self.mq_cb(mq).queue.pop_front()
    }

    pub(crate) fn mq_peek(&mut self, mq: MessageQueue) -> Option<Message> {
        self.mq_cb(mq).queue.front().copied()
    }

    pub(crate) fn mq_destroy(&mut self, mq: MessageQueue) -> Result<(), Error> {
        if !self.mq_cb(mq).queue.is_empty() {
            return Err(Error::MqNotEmpty);
        }
        self.mqueues.remove(mq.slot as usize);
        Ok(())
    }
}

impl MessageQueue {
    /// Create a message queue holding at most `capacity` messages.
    pub fn new(capacity: u16) -> Result<Self, Error> {
        let mut guard = klock::lock();
        guard.mq_create(capacity)
    }

    /// Append a message. Fails with [`Error::TaskBusy`] when full.
    pub fn enqueue(self, msg: Message) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.mq_enqueue(self, msg)
    }

    /// Remove and return the oldest message, or `None` when empty.
    pub fn dequeue(self) -> Option<Message> {
        let mut guard = klock::lock();
        guard.mq_dequeue(self)
    }

    /// The oldest message without removing it, or `None` when empty.
    pub fn peek(self) -> Option<Message> {
        let mut guard = klock::lock();
        guard.mq_peek(self)
    }

    /// Number of queued messages.
    pub fn len(self) -> usize {
        let mut guard = klock::lock();
        guard.mq_cb(self).queue.len()
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Destroy the queue. Fails with [`Error::MqNotEmpty`] while messages
    /// are pending.
    pub fn destroy(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.mq_destroy(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(v: usize) -> Message {
        v as Message
    }

    #[test]
    fn fifo_and_capacity() {
        let mut kcb = Kcb::new();
        let mq = kcb.mq_create(2).unwrap();
        kcb.mq_enqueue(mq, msg(1)).unwrap();
        kcb.mq_enqueue(mq, msg(2)).unwrap();
        assert_eq!(kcb.mq_enqueue(mq, msg(3)), Err(Error::TaskBusy));
        assert_eq!(kcb.mq_peek(mq), Some(msg(1)));
        assert_eq!(kcb.mq_dequeue(mq), Some(msg(1)));
        assert_eq!(kcb.mq_dequeue(mq), Some(msg(2)));
        assert_eq!(kcb.mq_dequeue(mq), None);
    }

    #[test]
    fn destroy_refuses_while_nonempty() {
        let mut kcb = Kcb::new();
        let mq = kcb.mq_create(2).unwrap();
        kcb.mq_enqueue(mq, msg(1)).unwrap();
        assert_eq!(kcb.mq_destroy(mq), Err(Error::MqNotEmpty));
        kcb.mq_dequeue(mq);
        assert_eq!(kcb.mq_destroy(mq), Ok(()));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut kcb = Kcb::new();
        assert_eq!(kcb.mq_create(0).unwrap_err(), Error::Fail);
    }
}
