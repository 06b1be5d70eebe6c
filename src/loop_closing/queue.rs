//! Input queue of candidate keyframes.
//!
//! The local mapper pushes every fresh keyframe; the worker consumes them
//! strictly in insertion order. The origin keyframe (id 0) is never a
//! candidate.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::atlas::{KeyFrameId, MapId};

/// FIFO of keyframes awaiting place recognition.
#[derive(Debug, Default)]
pub struct KeyFrameQueue {
    queue: Mutex<VecDeque<(KeyFrameId, MapId)>>,
}

impl KeyFrameQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a keyframe together with its owning map. The very first
    /// keyframe of the session is refused.
    pub fn push(&self, kf: KeyFrameId, map: MapId) {
        if kf.0 != 0 {
            self.queue.lock().push_back((kf, map));
        }
    }

    /// Whether a keyframe is waiting.
    pub fn has_new_keyframes(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Pop the oldest keyframe. The caller pins it (`SetNotErase`) before
    /// touching map state.
    pub fn pop(&self) -> Option<(KeyFrameId, MapId)> {
        self.queue.lock().pop_front()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Drop only the entries whose keyframe belongs to `map`.
    pub fn clear_map(&self, map: MapId) {
        self.queue.lock().retain(|&(_, m)| m != map);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = KeyFrameQueue::new();
        q.push(KeyFrameId::new(1), MapId::new(0));
        q.push(KeyFrameId::new(2), MapId::new(0));
        assert_eq!(q.pop().map(|(kf, _)| kf), Some(KeyFrameId::new(1)));
        assert_eq!(q.pop().map(|(kf, _)| kf), Some(KeyFrameId::new(2)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_origin_keyframe_is_refused() {
        let q = KeyFrameQueue::new();
        q.push(KeyFrameId::new(0), MapId::new(0));
        assert!(q.is_empty());
    }

    #[test]
    fn test_clear_map_is_selective() {
        let q = KeyFrameQueue::new();
        q.push(KeyFrameId::new(1), MapId::new(0));
        q.push(KeyFrameId::new(2), MapId::new(1));
        q.push(KeyFrameId::new(3), MapId::new(0));

        q.clear_map(MapId::new(0));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().map(|(kf, _)| kf), Some(KeyFrameId::new(2)));
    }
}
