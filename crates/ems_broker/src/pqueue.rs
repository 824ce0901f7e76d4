//! Min-heap of messages ordered by `priority` (an i64 deadline), with an
//! id → slot map so FIN/REQ/TOUCH can remove or reprioritize arbitrary
//! entries. One instance holds a channel's in-flight messages (priority
//! = timeout deadline), another its deferred ones (priority = scheduled
//! delivery time).

use std::collections::HashMap;

use crate::message::{Message, MessageId};

const SHRINK_FLOOR: usize = 25;

pub struct MessagePqueue {
    heap: Vec<Message>,
    slots: HashMap<MessageId, usize>,
}

impl MessagePqueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            slots: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.slots.get(id).map(|&slot| &self.heap[slot])
    }

    pub fn push(&mut self, mut msg: Message) {
        let n = self.heap.len();
        msg.index = n;
        self.slots.insert(msg.id, n);
        self.heap.push(msg);
        self.up(n);
    }

    pub fn pop(&mut self) -> Option<Message> {
        let n = self.heap.len();
        if n == 0 {
            return None;
        }
        self.swap_slots(0, n - 1);
        self.down(0, n - 1);
        let mut msg = self.heap.pop().unwrap();
        self.slots.remove(&msg.id);
        msg.index = usize::MAX;
        self.maybe_shrink();
        Some(msg)
    }

    /// Remove an arbitrary entry by id.
    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let slot = *self.slots.get(id)?;
        let n = self.heap.len();
        if slot != n - 1 {
            self.swap_slots(slot, n - 1);
            self.down(slot, n - 1);
            self.up(slot);
        }
        let mut msg = self.heap.pop().unwrap();
        self.slots.remove(&msg.id);
        msg.index = usize::MAX;
        self.maybe_shrink();
        Some(msg)
    }

    /// Reprioritize an entry in place (TOUCH).
    pub fn update_priority(&mut self, id: &MessageId, priority: i64) -> bool {
        let Some(&slot) = self.slots.get(id) else {
            return false;
        };
        self.heap[slot].priority = priority;
        let n = self.heap.len();
        self.down(slot, n);
        self.up(slot);
        true
    }

    /// If the top entry's priority is due (≤ `max`), pop and return it.
    /// Otherwise return how long until it would be due, so the caller
    /// knows how long to wait before re-peeking.
    pub fn peek_and_shift(&mut self, max: i64) -> (Option<Message>, i64) {
        match self.heap.first() {
            None => (None, 0),
            Some(top) if top.priority > max => (None, top.priority - max),
            Some(_) => (self.pop(), 0),
        }
    }

    /// Drain every entry, heap order not guaranteed.
    pub fn drain(&mut self) -> Vec<Message> {
        self.slots.clear();
        let mut out = std::mem::take(&mut self.heap);
        for m in &mut out {
            m.index = usize::MAX;
        }
        out
    }

    fn swap_slots(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.heap[i].index = i;
        self.heap[j].index = j;
        let id_i = self.heap[i].id;
        let id_j = self.heap[j].id;
        self.slots.insert(id_i, i);
        self.slots.insert(id_j, j);
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let i = (j - 1) / 2;
            if self.heap[j].priority >= self.heap[i].priority {
                break;
            }
            self.swap_slots(i, j);
            j = i;
        }
    }

    fn down(&mut self, mut i: usize, n: usize) {
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut j = left;
            let right = left + 1;
            if right < n && self.heap[right].priority < self.heap[left].priority {
                j = right;
            }
            if self.heap[j].priority >= self.heap[i].priority {
                break;
            }
            self.swap_slots(i, j);
            i = j;
        }
    }

    fn maybe_shrink(&mut self) {
        let cap = self.heap.capacity();
        if cap > SHRINK_FLOOR && self.heap.len() < cap / 4 {
            self.heap.shrink_to(cap / 2);
        }
    }
}
