//! Resume state and the outbound replay buffer.

use std::collections::VecDeque;

/// Resumable session handed out by READY.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session ID to present in RESUME.
    pub session_id: String,
    /// Gateway URL to resume against.
    pub resume_url: String,
}

/// Bounded queue of outbound frames sent since the last acknowledged
/// sequence.
///
/// Frames sent close to a disconnect may never have reached Discord, so
/// they are kept here and re-sent once a RESUME succeeds; the buffer is
/// cleared afterwards, and a fresh IDENTIFY discards it along with the
/// session.
#[derive(Debug)]
pub struct ReplayBuffer {
    frames: VecDeque<String>,
    limit: usize,
}

impl ReplayBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(limit.min(16)),
            limit,
        }
    }

    /// Remember an outbound frame, evicting the oldest when full.
    pub fn push(&mut self, frame: String) {
        if self.frames.len() == self.limit {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Take every buffered frame, oldest first, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_order_and_empties() {
        let mut buffer = ReplayBuffer::new(8);
        buffer.push("a".into());
        buffer.push("b".into());

        assert_eq!(buffer.drain(), vec!["a".to_string(), "b".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn bounded_eviction_drops_oldest() {
        let mut buffer = ReplayBuffer::new(2);
        buffer.push("a".into());
        buffer.push("b".into());
        buffer.push("c".into());

        assert_eq!(buffer.drain(), vec!["b".to_string(), "c".to_string()]);
    }
}
