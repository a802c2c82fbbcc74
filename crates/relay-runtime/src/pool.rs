use std::collections::HashMap;

use indexmap::IndexMap;
use relay_protocol::{ActionId, ClientError, ClientResult};

use crate::action::Action;

pub type IdleTask = Box<dyn FnOnce() + Send>;

/// One reusable transport handle and the actions bundled into its request.
#[derive(Debug)]
pub struct ConnectionSlot {
    index: usize,
    marker: u64,
    background: bool,
    actions: IndexMap<ActionId, Action>,
}

impl ConnectionSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            marker: 0,
            background: false,
            actions: IndexMap::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn marker(&self) -> u64 {
        self.marker
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn add_action(&mut self, action: Action) -> ClientResult<()> {
        let id = action.id().clone();
        if self.actions.contains_key(&id) {
            return Err(ClientError::DuplicateAction.for_action(&id));
        }
        self.actions.insert(id, action);
        Ok(())
    }

    /// Remove and return the action waiting on `id`.
    pub fn take_action(&mut self, id: &ActionId) -> Option<Action> {
        self.actions.shift_remove(id)
    }

    pub fn take_actions(&mut self) -> IndexMap<ActionId, Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.values()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn reset(&mut self) {
        self.actions.clear();
        self.background = false;
    }
}

/// Fixed set of connection slots cycling between available and in flight.
pub struct SlotPool {
    size: usize,
    available: Vec<ConnectionSlot>,
    in_flight: HashMap<usize, ConnectionSlot>,
    next_marker: u64,
    idle_queue: Vec<IdleTask>,
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("size", &self.size)
            .field("available", &self.available.len())
            .field("in_flight", &self.in_flight.len())
            .field("idle_queue", &self.idle_queue.len())
            .finish()
    }
}

impl SlotPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            available: (0..size).rev().map(ConnectionSlot::new).collect(),
            in_flight: HashMap::new(),
            next_marker: 0,
            idle_queue: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }

    pub fn in_flight(&self, exclude_background: bool) -> usize {
        if exclude_background {
            self.in_flight
                .values()
                .filter(|slot| !slot.background)
                .count()
        } else {
            self.in_flight.len()
        }
    }

    /// Take a free slot. Background requests never take the last free slot
    /// of a multi-slot pool, which stays reserved for foreground work.
    pub fn acquire(&mut self, background: bool) -> Option<usize> {
        if background && self.size > 1 && self.available.len() <= 1 {
            return None;
        }
        let mut slot = self.available.pop()?;
        self.next_marker += 1;
        slot.marker = self.next_marker;
        slot.background = background;
        let index = slot.index;
        self.in_flight.insert(index, slot);
        Some(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut ConnectionSlot> {
        self.in_flight.get_mut(&index)
    }

    /// Return a slot to the pool. When nothing remains in flight the queued
    /// idle tasks are handed back for the caller to run.
    pub fn release(&mut self, index: usize) -> Vec<IdleTask> {
        if let Some(mut slot) = self.in_flight.remove(&index) {
            slot.reset();
            self.available.push(slot);
        }
        if self.in_flight.is_empty() {
            std::mem::take(&mut self.idle_queue)
        } else {
            Vec::new()
        }
    }

    /// Queue `task` unless nothing is in flight, in which case it is returned
    /// to be run right away.
    pub fn when_idle(&mut self, task: IdleTask) -> Option<IdleTask> {
        if self.in_flight.is_empty() {
            Some(task)
        } else {
            self.idle_queue.push(task);
            None
        }
    }
}
