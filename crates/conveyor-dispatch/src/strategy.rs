use std::sync::Mutex;

/// How a multi-store dispatcher walks the store list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Start from the cached next index and rotate until a store yields a
    /// non-empty claim or every store has been tried.
    #[default]
    RoundRobin,
    /// Stick to the last store that yielded non-empty until it runs dry,
    /// then advance.
    DrainFirst,
}

#[derive(Debug, Default)]
struct SelectorState {
    next_index: usize,
    sticky_key: Option<String>,
}

/// Cached selection state shared across `run_once` invocations.
///
/// Operates on store keys so it stays independent of handle types; the
/// mutex is held only around in-memory reads and writes.
#[derive(Debug)]
pub struct StoreSelector {
    strategy: SelectionStrategy,
    state: Mutex<SelectorState>,
}

impl StoreSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(SelectorState::default()),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// The order in which to try the given stores this round.
    pub fn visit_order(&self, keys: &[String]) -> Vec<usize> {
        if keys.is_empty() {
            return Vec::new();
        }

        let state = self.state.lock().expect("selector state poisoned");
        match self.strategy {
            SelectionStrategy::RoundRobin => {
                let start = state.next_index % keys.len();
                (0..keys.len()).map(|i| (start + i) % keys.len()).collect()
            }
            SelectionStrategy::DrainFirst => {
                let sticky = state
                    .sticky_key
                    .as_deref()
                    .and_then(|key| keys.iter().position(|k| k == key));
                match sticky {
                    Some(first) => {
                        let mut order = vec![first];
                        order.extend((0..keys.len()).filter(|&i| i != first));
                        order
                    }
                    None => (0..keys.len()).collect(),
                }
            }
        }
    }

    /// Record the outcome of claiming from `keys[index]`.
    pub fn note_result(&self, keys: &[String], index: usize, non_empty: bool) {
        if keys.is_empty() {
            return;
        }

        let mut state = self.state.lock().expect("selector state poisoned");
        match self.strategy {
            SelectionStrategy::RoundRobin => {
                if non_empty {
                    state.next_index = (index + 1) % keys.len();
                }
            }
            SelectionStrategy::DrainFirst => {
                if non_empty {
                    state.sticky_key = Some(keys[index].clone());
                } else if state.sticky_key.as_deref() == Some(keys[index].as_str()) {
                    state.sticky_key = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn round_robin_rotates_past_the_yielding_store() {
        let selector = StoreSelector::new(SelectionStrategy::RoundRobin);
        let keys = keys(&["a", "b", "c"]);

        assert_eq!(selector.visit_order(&keys), vec![0, 1, 2]);
        selector.note_result(&keys, 0, true);
        assert_eq!(selector.visit_order(&keys), vec![1, 2, 0]);

        // An empty claim does not advance the cached index.
        selector.note_result(&keys, 1, false);
        assert_eq!(selector.visit_order(&keys), vec![1, 2, 0]);

        selector.note_result(&keys, 2, true);
        assert_eq!(selector.visit_order(&keys), vec![0, 1, 2]);
    }

    #[test]
    fn drain_first_sticks_until_empty() {
        let selector = StoreSelector::new(SelectionStrategy::DrainFirst);
        let keys = keys(&["a", "b", "c"]);

        assert_eq!(selector.visit_order(&keys), vec![0, 1, 2]);
        selector.note_result(&keys, 1, true);
        assert_eq!(selector.visit_order(&keys), vec![1, 0, 2]);
        selector.note_result(&keys, 1, true);
        assert_eq!(selector.visit_order(&keys), vec![1, 0, 2]);

        selector.note_result(&keys, 1, false);
        assert_eq!(selector.visit_order(&keys), vec![0, 1, 2]);
    }

    #[test]
    fn sticky_key_survives_store_list_changes() {
        let selector = StoreSelector::new(SelectionStrategy::DrainFirst);
        let three = keys(&["a", "b", "c"]);
        selector.note_result(&three, 2, true);

        // "c" moved position after a provider refresh.
        let reordered = keys(&["c", "x", "a"]);
        assert_eq!(selector.visit_order(&reordered), vec![0, 1, 2]);

        // "c" vanished entirely; fall back to list order.
        let without = keys(&["x", "a"]);
        assert_eq!(selector.visit_order(&without), vec![0, 1]);
    }

    #[test]
    fn round_robin_index_wraps_shrunken_lists() {
        let selector = StoreSelector::new(SelectionStrategy::RoundRobin);
        let four = keys(&["a", "b", "c", "d"]);
        selector.note_result(&four, 3, true);

        let two = keys(&["a", "b"]);
        assert_eq!(selector.visit_order(&two), vec![0, 1]);
    }
}
