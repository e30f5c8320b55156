use std::collections::VecDeque;

use dojo_netproto::input::PortInputState;

/// The last `depth` resolved states of one port, oldest first.
#[derive(Debug, Clone)]
pub struct BackfillWindow {
    states: VecDeque<PortInputState>,
    capacity: usize,
}

impl BackfillWindow {
    /// A window of `depth` entries. A depth of 0 still remembers the latest
    /// value so overflow policies have something to repeat.
    pub fn new(depth: u8) -> Self {
        let capacity = usize::from(depth).max(1);
        Self {
            states: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, state: PortInputState) {
        if self.states.len() == self.capacity {
            self.states.pop_front();
        }
        self.states.push_back(state);
    }

    pub fn latest(&self) -> Option<PortInputState> {
        self.states.back().copied()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortInputState> {
        self.states.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(buttons: u16) -> PortInputState {
        PortInputState::new(buttons, [0; 4])
    }

    #[test]
    fn keeps_only_depth_entries() {
        let mut w = BackfillWindow::new(3);
        for b in 1..=5 {
            w.push(s(b));
        }
        assert_eq!(w.len(), 3);
        let kept: Vec<u16> = w.iter().map(|st| st.buttons).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(w.latest(), Some(s(5)));
    }

    #[test]
    fn zero_depth_still_tracks_latest() {
        let mut w = BackfillWindow::new(0);
        assert!(w.is_empty());
        w.push(s(1));
        w.push(s(2));
        assert_eq!(w.len(), 1);
        assert_eq!(w.latest(), Some(s(2)));
    }
}
