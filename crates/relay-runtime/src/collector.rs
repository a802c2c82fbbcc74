use std::collections::VecDeque;

use relay_protocol::StoredEntry;

use crate::action::Action;
use crate::join::PendingJoin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Collecting,
    Completing,
}

/// Per-pass bookkeeping. Only one exists at a time; `generation` tells
/// late continuations whether they still belong to it.
#[derive(Debug)]
pub(crate) struct Collector {
    pub generation: u64,
    pub stage: Stage,
    pub join: PendingJoin,
    /// Server actions by walk position. `None` until the position settles,
    /// and stays `None` when the cache answered without a follow-up.
    pub collected: Vec<Option<Action>>,
    pub client_actions: VecDeque<Action>,
    /// Cache hits whose callbacks run after the flush.
    pub completions: VecDeque<(Action, StoredEntry)>,
    pub actions_completed: usize,
    pub flushed: bool,
}

impl Collector {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            stage: Stage::Collecting,
            join: PendingJoin::new(),
            collected: Vec::new(),
            client_actions: VecDeque::new(),
            completions: VecDeque::new(),
            actions_completed: 0,
            flushed: false,
        }
    }

    /// Prepare for another walk within the same pass.
    pub fn rewind(&mut self) {
        self.join = PendingJoin::new();
        self.collected.clear();
        self.flushed = false;
    }

    pub fn reserve_slot(&mut self) -> usize {
        self.collected.push(None);
        self.collected.len() - 1
    }

    pub fn fill_slot(&mut self, index: usize, action: Action) {
        if let Some(slot) = self.collected.get_mut(index) {
            *slot = Some(action);
        }
    }

    /// Whether the walk has fully settled.
    pub fn is_settled(&self) -> bool {
        self.join.is_complete() && self.client_actions.is_empty()
    }

    pub fn drain_collected(&mut self) -> Vec<Action> {
        self.collected.drain(..).flatten().collect()
    }
}
