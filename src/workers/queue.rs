use std::collections::{HashMap, VecDeque};

use crate::workers::task::Task;

/// FIFO of tasks waiting for a free unit. Insertion order is dispatch order.
#[derive(Default)]
pub(crate) struct PendingQueue {
    tasks: VecDeque<Task>,
}

impl PendingQueue {
    pub fn push_back(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    pub fn pop_front(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.tasks.drain(..)
    }
}

/// In-flight tasks keyed by unit ordinal; a unit runs at most one task.
#[derive(Default)]
pub(crate) struct ActiveTable {
    by_unit: HashMap<usize, Task>,
}

impl ActiveTable {
    /// Returns the previous occupant if the slot was not free.
    pub fn bind(&mut self, ordinal: usize, task: Task) -> Option<Task> {
        self.by_unit.insert(ordinal, task)
    }

    pub fn unbind(&mut self, ordinal: usize) -> Option<Task> {
        self.by_unit.remove(&ordinal)
    }

    pub fn get(&self, ordinal: usize) -> Option<&Task> {
        self.by_unit.get(&ordinal)
    }

    pub fn is_bound(&self, ordinal: usize) -> bool {
        self.by_unit.contains_key(&ordinal)
    }

    pub fn len(&self) -> usize {
        self.by_unit.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (usize, Task)> + '_ {
        self.by_unit.drain()
    }
}
