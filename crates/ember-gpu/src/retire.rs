//! Delayed release of objects replaced while frames are still in flight.
//!
//! A swapchain replaced by recreation may still be referenced by submissions
//! from earlier frames. It is parked here, tagged with the frame counter at
//! retirement, and handed back once every in-flight slot has cycled past it:
//! after N further `begin_frame` calls each slot's fence has been waited on at
//! least once since retirement.

use std::collections::VecDeque;

use crate::swapchain::Swapchain;

/// An object waiting for its frames to retire.
struct Retired<T> {
    item: T,
    retired_at: u64,
}

/// FIFO of retired objects keyed by the frame counter.
pub struct RetirementQueue<T> {
    pending: VecDeque<Retired<T>>,
    frames_in_flight: u64,
}

/// Swapchains replaced by recreation.
pub type RetiredChains = RetirementQueue<Swapchain>;

impl<T> RetirementQueue<T> {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight: frames_in_flight as u64,
        }
    }

    /// Park `item`, retired while the frame counter reads `frame_counter`.
    pub fn retire(&mut self, item: T, frame_counter: u64) {
        self.pending.push_back(Retired {
            item,
            retired_at: frame_counter,
        });
    }

    /// Remove and return every item whose frames have all retired.
    pub fn drain_ready(&mut self, frame_counter: u64) -> Vec<T> {
        let mut ready = Vec::new();

        // Frame counters are non-decreasing, so only the front can mature.
        while self
            .pending
            .front()
            .is_some_and(|p| frame_counter >= p.retired_at + self.frames_in_flight)
        {
            if let Some(retired) = self.pending.pop_front() {
                ready.push(retired.item);
            }
        }

        ready
    }

    /// Remove everything regardless of age. Only valid once the device is idle.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.pending.drain(..).map(|p| p.item).collect()
    }

    /// Number of items still waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_until_every_slot_cycles() {
        let mut queue = RetirementQueue::new(2);
        queue.retire("old", 5);

        assert!(queue.drain_ready(5).is_empty());
        assert!(queue.drain_ready(6).is_empty());
        assert_eq!(queue.drain_ready(7), vec!["old"]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn drains_in_retirement_order() {
        let mut queue = RetirementQueue::new(1);
        queue.retire(1, 0);
        queue.retire(2, 1);
        queue.retire(3, 4);

        assert_eq!(queue.drain_ready(2), vec![1, 2]);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.drain_ready(5), vec![3]);
    }

    #[test]
    fn drain_all_ignores_age() {
        let mut queue = RetirementQueue::new(3);
        queue.retire('a', 10);
        queue.retire('b', 11);

        assert_eq!(queue.drain_all(), vec!['a', 'b']);
        assert_eq!(queue.pending_count(), 0);
    }
}
