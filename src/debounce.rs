use crate::command::{Button, CommandSet};

/// Consecutive-press counter for one button.
///
/// Once the button has been requested for more than `threshold` consecutive
/// cycles it is force-released for one cycle and the count starts over.
#[derive(Debug, Clone)]
pub struct RepetitionCounter {
    pub button: Button,
    pub threshold: u32,
    count: u32,
}

impl RepetitionCounter {
    pub fn new(button: Button, threshold: u32) -> Self {
        Self {
            button,
            threshold,
            count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns true if the button was stripped from `set`
    pub fn apply(&mut self, set: &mut CommandSet) -> bool {
        if !set.contains(self.button) {
            self.count = 0;
            return false;
        }
        self.count += 1;
        if self.count > self.threshold {
            set.remove(self.button);
            self.count = 0;
            return true;
        }
        false
    }
}

pub struct ActionDebouncer {
    counters: Vec<RepetitionCounter>,
}

impl Default for ActionDebouncer {
    /// Jump (A) may be held for 20 cycles, fire (B) for 5
    fn default() -> Self {
        Self::new([(Button::A, 20), (Button::B, 5)])
    }
}

impl ActionDebouncer {
    pub fn new(tracked: impl IntoIterator<Item = (Button, u32)>) -> Self {
        Self {
            counters: tracked
                .into_iter()
                .map(|(button, threshold)| RepetitionCounter::new(button, threshold))
                .collect(),
        }
    }

    pub fn filter(&mut self, mut set: CommandSet) -> CommandSet {
        for counter in &mut self.counters {
            if counter.apply(&mut set) {
                tracing::debug!(button = %counter.button, "released held button");
            }
        }
        set
    }

    pub fn counter(&self, button: Button) -> Option<&RepetitionCounter> {
        self.counters.iter().find(|c| c.button == button)
    }
}
