//! Per-stream subscription status
//!
//! Shared by the registry-side add logic and the single-upstream receiver
//! client. Transitions are driven only by frames: `Added|Down -> Ok` on
//! `Update`, `Ok|Added -> Down` on `Down`.

use serde::{Deserialize, Serialize};

/// Status of one stream within a sync subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    /// Subscribed, no update seen yet.
    Added,
    /// At least one update seen.
    Ok,
    /// Backend reported the stream unreachable; eligible for retry.
    Down,
}

impl StreamStatus {
    /// Apply an `Update` frame, returning the previous status.
    pub fn on_update(&mut self) -> StreamStatus {
        std::mem::replace(self, StreamStatus::Ok)
    }

    /// Apply a `Down` frame, returning the previous status.
    pub fn on_down(&mut self) -> StreamStatus {
        std::mem::replace(self, StreamStatus::Down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_moves_to_ok() {
        let mut s = StreamStatus::Added;
        assert_eq!(s.on_update(), StreamStatus::Added);
        assert_eq!(s, StreamStatus::Ok);

        let mut s = StreamStatus::Down;
        assert_eq!(s.on_update(), StreamStatus::Down);
        assert_eq!(s, StreamStatus::Ok);
    }

    #[test]
    fn test_down_moves_to_down() {
        let mut s = StreamStatus::Ok;
        assert_eq!(s.on_down(), StreamStatus::Ok);
        assert_eq!(s, StreamStatus::Down);

        let mut s = StreamStatus::Added;
        assert_eq!(s.on_down(), StreamStatus::Added);
        assert_eq!(s, StreamStatus::Down);
    }
}
