use super::model::SortKey;

/// Holds the active sort key.
///
/// Requests capture the key they were issued under; results are applied only
/// while [`SortController::is_current`] still holds for that key, so the
/// visible list always belongs to the most recently requested order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortController {
    active: SortKey,
}

impl SortController {
    pub fn new(initial: SortKey) -> Self {
        Self { active: initial }
    }

    pub fn active(&self) -> SortKey {
        self.active
    }

    /// Switches to `key`. Returns false if it was already active.
    pub fn change(&mut self, key: SortKey) -> bool {
        if self.active == key {
            return false;
        }
        tracing::debug!(from = %self.active, to = %key, "Sort order changed");
        self.active = key;
        true
    }

    pub fn is_current(&self, key: SortKey) -> bool {
        self.active == key
    }
}
