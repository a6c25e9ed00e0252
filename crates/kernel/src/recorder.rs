use std::collections::VecDeque;

use glam::DVec3;

pub const DEFAULT_RECORDER_CAPACITY: usize = 100;

/// One displacement performed during a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Movement {
    pub from: DVec3,
    pub to: DVec3,
    /// The requested (pre-collision) motion when the displacement was
    /// resolved axis by axis. `None` for teleports, merged and synthesized
    /// segments, which are traversed as one straight line.
    pub axis_dependent_original: Option<DVec3>,
}

impl Movement {
    pub fn straight(from: DVec3, to: DVec3) -> Self {
        Self {
            from,
            to,
            axis_dependent_original: None,
        }
    }

    pub fn delta(&self) -> DVec3 {
        self.to - self.from
    }
}

/// Bounded FIFO of this tick's movements. When full, the two oldest entries
/// merge so the covered path stays continuous while memory stays bounded.
#[derive(Debug, Clone)]
pub struct MovementRecorder {
    entries: VecDeque<Movement>,
    capacity: usize,
}

impl Default for MovementRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RECORDER_CAPACITY)
    }
}

impl MovementRecorder {
    /// Capacity below two cannot merge and is raised to two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Movement> {
        self.entries.iter()
    }

    pub fn record(&mut self, movement: Movement) {
        if self.entries.len() >= self.capacity {
            if let (Some(oldest), Some(next)) = (self.entries.pop_front(), self.entries.pop_front()) {
                self.entries
                    .push_front(Movement::straight(oldest.from, next.to));
            }
        }
        self.entries.push_back(movement);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn drain(&mut self) -> Vec<Movement> {
        self.entries.drain(..).collect()
    }

    /// Drains the tick's movements, or synthesizes a single straight segment
    /// from the previous to the current position when nothing was recorded.
    pub fn drain_or_synthesize(&mut self, previous: DVec3, current: DVec3) -> Vec<Movement> {
        if self.entries.is_empty() {
            return vec![Movement::straight(previous, current)];
        }
        self.drain()
    }
}
