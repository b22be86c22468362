//! Interrupt-context signalling.
//!
//! Edge watchers and the serial reader run on their own threads and never
//! touch a bus. They raise an [`IrqFlag`] or enqueue a byte; the kiosk loop is
//! the only consumer. Consumers must [`take`](IrqFlag::take) a flag before
//! acting on it so a re-assertion that arrives meanwhile is not lost.

use heapless::spsc::{Consumer, Producer, Queue};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A single-bit level flag with atomic test-and-clear.
#[derive(Debug, Default)]
pub struct IrqFlag(AtomicBool);

impl IrqFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Ring slots; one is always kept free, so 63 bytes can be pending.
pub const COMMAND_QUEUE_SLOTS: usize = 64;

pub type CommandQueue = Queue<u8, COMMAND_QUEUE_SLOTS>;

/// Producer side of the command byte ring.
pub struct CommandSender<'a> {
    producer: Producer<'a, u8, COMMAND_QUEUE_SLOTS>,
    dropped: usize,
}

impl CommandSender<'_> {
    /// Enqueue without blocking; a full ring drops `byte`.
    pub fn push(&mut self, byte: u8) -> bool {
        match self.producer.enqueue(byte) {
            Ok(()) => true,
            Err(_) => {
                self.dropped += 1;
                debug!(dropped = self.dropped, "command ring full, byte dropped");
                false
            }
        }
    }

    /// Bytes dropped on overflow so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Consumer side of the command byte ring.
pub struct CommandReceiver<'a> {
    consumer: Consumer<'a, u8, COMMAND_QUEUE_SLOTS>,
}

impl CommandReceiver<'_> {
    pub fn pop(&mut self) -> Option<u8> {
        self.consumer.dequeue()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.len() == 0
    }
}

/// Split a caller-owned ring.
pub fn split(queue: &mut CommandQueue) -> (CommandSender<'_>, CommandReceiver<'_>) {
    let (producer, consumer) = queue.split();
    (
        CommandSender {
            producer,
            dropped: 0,
        },
        CommandReceiver { consumer },
    )
}

/// A process-lifetime ring whose halves can move to different threads.
pub fn command_channel() -> (CommandSender<'static>, CommandReceiver<'static>) {
    let queue: &'static mut CommandQueue = Box::leak(Box::new(Queue::new()));
    split(queue)
}
