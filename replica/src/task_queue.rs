use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
};

/// Handle to a queued task, used to cancel or re-prioritize it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

#[derive(PartialEq, Eq)]
struct HeapEntry {
    priority: u32,
    sequence: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority first, then earlier insertion
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of tasks. Higher priority runs first; equal priorities
/// run in insertion order. Cancelled and re-prioritized entries are left in
/// the heap and skipped when they surface.
pub struct TaskQueue<T> {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<u64, (u32, T)>,
    next_sequence: u64,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            tasks: HashMap::new(),
            next_sequence: 0,
        }
    }

    pub fn push(&mut self, task: T, priority: u32) -> TaskHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.tasks.insert(sequence, (priority, task));
        self.heap.push(HeapEntry { priority, sequence });
        TaskHandle(sequence)
    }

    pub fn pop(&mut self) -> Option<(TaskHandle, T)> {
        while let Some(entry) = self.heap.pop() {
            let current = self.tasks.get(&entry.sequence).map(|(priority, _)| *priority);
            if current != Some(entry.priority) {
                // cancelled or superseded
                continue;
            }
            let (_, task) = self.tasks.remove(&entry.sequence)?;
            return Some((TaskHandle(entry.sequence), task));
        }
        None
    }

    pub fn cancel(&mut self, handle: TaskHandle) -> Option<T> {
        self.tasks.remove(&handle.0).map(|(_, task)| task)
    }

    /// Returns false if the task already ran or was cancelled
    pub fn set_priority(&mut self, handle: TaskHandle, priority: u32) -> bool {
        let Some((current, _)) = self.tasks.get_mut(&handle.0) else {
            return false;
        };
        if *current != priority {
            *current = priority;
            self.heap.push(HeapEntry {
                priority,
                sequence: handle.0,
            });
        }
        true
    }

    pub fn contains(&self, handle: TaskHandle) -> bool {
        self.tasks.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Remove every queued task, returning them in run order
    pub fn drain(&mut self) -> Vec<T> {
        let mut output = Vec::with_capacity(self.tasks.len());
        while let Some((_, task)) = self.pop() {
            output.push(task);
        }
        self.heap.clear();
        output
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
