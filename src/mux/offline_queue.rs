//! Offline Command Queue: bounded FIFO of commands issued while the link is down.

use std::collections::VecDeque;
use crate::mux::types::PendingCommand;

#[derive(Debug)]
pub struct OfflineQueue {
    capacity: usize,
    items: VecDeque<PendingCommand>,
}

/// Result of a flush: what went out (with whatever the sender returned for
/// it), and the failure that stopped it (if any).
#[derive(Debug)]
pub struct FlushOutcome<T, E> {
    pub sent: Vec<(T, PendingCommand)>,
    pub failed: Option<(PendingCommand, E)>,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), items: VecDeque::new() }
    }

    /// Appends, evicting the oldest entry when full. Returns the evicted command.
    pub fn enqueue(&mut self, cmd: PendingCommand) -> Option<PendingCommand> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(cmd);
        evicted
    }

    /// Puts commands back ahead of everything queued, keeping their order.
    /// Overflow evicts from the front. Returns how many were evicted.
    pub fn requeue_front(&mut self, cmds: Vec<PendingCommand>) -> usize {
        for cmd in cmds.into_iter().rev() {
            self.items.push_front(cmd);
        }
        let overflow = self.items.len().saturating_sub(self.capacity);
        self.items.drain(..overflow);
        overflow
    }

    /// Sends entries front to back. The first failure stops the flush and the
    /// failing entry stays at the front, followed by the untouched rest.
    pub fn flush<T, E, F>(&mut self, mut send: F) -> FlushOutcome<T, E>
    where
        F: FnMut(&PendingCommand) -> Result<T, E>,
    {
        let mut sent = Vec::new();
        while let Some(front) = self.items.front() {
            match send(front) {
                Ok(receipt) => {
                    if let Some(cmd) = self.items.pop_front() {
                        sent.push((receipt, cmd));
                    }
                }
                Err(e) => {
                    let failed = front.clone();
                    return FlushOutcome { sent, failed: Some((failed, e)) };
                }
            }
        }
        FlushOutcome { sent, failed: None }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingCommand> {
        self.items.iter()
    }
}
