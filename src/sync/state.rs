//! Per-category sync state
//!
//! Pure state transitions: commands go in, effects come out. The
//! [`SyncStateMachine`](super::SyncStateMachine) executes the effects.

use serde::Serialize;

use super::types::{FailReason, SessionId, SyncResult, SyncUpdate};
use crate::category::Category;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Loading,
    Success,
    Fail,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    attempt: SessionId,
    current: Option<SyncResult>,
}

impl Entry {
    fn new() -> Self {
        Self {
            attempt: SessionId(0),
            current: None,
        }
    }

    fn phase(&self) -> Phase {
        match self.current {
            None => Phase::Idle,
            Some(SyncResult::Loading { .. }) => Phase::Loading,
            Some(SyncResult::Success) => Phase::Success,
            Some(SyncResult::Fail { .. }) => Phase::Fail,
        }
    }

    /// Invalidate the running attempt so its later deliveries are dropped.
    fn supersede(&mut self) {
        self.attempt = SessionId(self.attempt.0 + 1);
        if self.phase() == Phase::Loading {
            self.current = None;
        }
    }

    fn update(&self, category: Category) -> Option<SyncUpdate> {
        self.current.map(|result| SyncUpdate {
            category,
            session: self.attempt,
            result,
        })
    }
}

/// Selection plus the current result of each category.
#[derive(Clone, Debug)]
pub struct SyncState {
    selected: Category,
    primary: Entry,
    secondary: Entry,
}

impl SyncState {
    #[must_use]
    pub fn new(selected: Category) -> Self {
        Self {
            selected,
            primary: Entry::new(),
            secondary: Entry::new(),
        }
    }

    fn entry(&self, category: Category) -> &Entry {
        match category {
            Category::Primary => &self.primary,
            Category::Secondary => &self.secondary,
        }
    }

    fn entry_mut(&mut self, category: Category) -> &mut Entry {
        match category {
            Category::Primary => &mut self.primary,
            Category::Secondary => &mut self.secondary,
        }
    }

    #[must_use]
    pub fn selected(&self) -> Category {
        self.selected
    }

    #[must_use]
    pub fn phase(&self, category: Category) -> Phase {
        self.entry(category).phase()
    }

    #[must_use]
    pub fn current(&self, category: Category) -> Option<SyncResult> {
        self.entry(category).current
    }

    #[must_use]
    pub fn attempt(&self, category: Category) -> SessionId {
        self.entry(category).attempt
    }

    /// True while `attempt` is still the live refresh of `category`.
    #[must_use]
    pub fn is_live(&self, category: Category, attempt: SessionId) -> bool {
        let entry = self.entry(category);
        entry.attempt == attempt && entry.phase() == Phase::Loading
    }

    /// Apply a command and return resulting effects
    #[must_use]
    pub fn apply(&mut self, cmd: Command) -> Vec<Effect> {
        match cmd {
            Command::Select(category) => {
                if self.selected == category {
                    return vec![];
                }
                let previous = self.selected;
                self.selected = category;
                self.entry_mut(previous).supersede();
                vec![Effect::RetireDecoder(previous), Effect::Refresh(category)]
            }

            Command::BeginRefresh(category) => {
                let entry = self.entry_mut(category);
                if entry.phase() == Phase::Loading {
                    return vec![];
                }
                entry.attempt = SessionId(entry.attempt.0 + 1);
                entry.current = Some(SyncResult::indeterminate());
                vec![Effect::Started(entry.attempt)]
            }

            Command::Announce { category, attempt } => {
                self.deliver(category, attempt, SyncResult::indeterminate())
            }

            Command::Deliver {
                category,
                attempt,
                result,
            } => self.deliver(category, attempt, result),

            Command::Fail {
                category,
                attempt,
                reason,
            } => self.deliver(category, attempt, SyncResult::fail(reason)),

            Command::Abandon { category, attempt } => {
                let entry = self.entry_mut(category);
                if entry.attempt == attempt && entry.phase() == Phase::Loading {
                    entry.current = None;
                }
                vec![]
            }

            Command::CachedAvailable(category) => {
                let entry = self.entry_mut(category);
                if entry.phase() != Phase::Idle {
                    return vec![];
                }
                entry.current = Some(SyncResult::Success);
                entry.update(category).map(Effect::Publish).into_iter().collect()
            }

            Command::ContentChanged => {
                self.primary.supersede();
                self.secondary.supersede();
                self.primary.current = None;
                self.secondary.current = None;
                vec![
                    Effect::RetireAllDecoders,
                    Effect::ClearCache,
                    Effect::Refresh(self.selected),
                ]
            }
        }
    }

    fn deliver(&mut self, category: Category, attempt: SessionId, result: SyncResult) -> Vec<Effect> {
        let entry = self.entry_mut(category);
        if entry.attempt != attempt || entry.phase() != Phase::Loading {
            return vec![Effect::Discarded(SyncUpdate {
                category,
                session: attempt,
                result,
            })];
        }

        entry.current = Some(result);
        entry.update(category).map(Effect::Publish).into_iter().collect()
    }
}

/// Commands that modify sync state
#[derive(Clone, Debug)]
pub enum Command {
    /// Make a category the selected one
    Select(Category),
    /// Enter `Loading` unless a refresh is already running
    BeginRefresh(Category),
    /// Publish the indeterminate `Loading` of a started attempt
    Announce { category: Category, attempt: SessionId },
    /// Forward a result of a running attempt
    Deliver {
        category: Category,
        attempt: SessionId,
        result: SyncResult,
    },
    /// End a running attempt with a failure
    Fail {
        category: Category,
        attempt: SessionId,
        reason: FailReason,
    },
    /// End a running attempt without a result
    Abandon { category: Category, attempt: SessionId },
    /// A cached file can be shown before any refresh
    CachedAvailable(Category),
    /// Server-side content changed; everything cached is stale
    ContentChanged,
}

/// Effects produced by state changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// A refresh attempt was admitted with this id
    Started(SessionId),
    /// Deliver an update to subscribers
    Publish(SyncUpdate),
    /// An update from a superseded attempt was dropped
    Discarded(SyncUpdate),
    /// Close the decoder bound to a category
    RetireDecoder(Category),
    /// Close every decoder
    RetireAllDecoders,
    /// Delete every cached document
    ClearCache,
    /// Start a refresh for a category
    Refresh(Category),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(state: &mut SyncState, category: Category) -> SessionId {
        match state.apply(Command::BeginRefresh(category)).as_slice() {
            [Effect::Started(attempt)] => *attempt,
            other => panic!("refresh not admitted: {other:?}"),
        }
    }

    #[test]
    fn begin_refresh_is_single_flight() {
        let mut state = SyncState::new(Category::Primary);
        begin(&mut state, Category::Primary);
        assert_eq!(state.phase(Category::Primary), Phase::Loading);

        assert!(state.apply(Command::BeginRefresh(Category::Primary)).is_empty());
        // The other category is independent.
        begin(&mut state, Category::Secondary);
    }

    #[test]
    fn deliver_replaces_current_and_publishes() {
        let mut state = SyncState::new(Category::Primary);
        let attempt = begin(&mut state, Category::Primary);

        let effects = state.apply(Command::Deliver {
            category: Category::Primary,
            attempt,
            result: SyncResult::loading(40),
        });
        assert_eq!(
            effects,
            vec![Effect::Publish(SyncUpdate {
                category: Category::Primary,
                session: attempt,
                result: SyncResult::loading(40),
            })]
        );

        state.apply(Command::Deliver {
            category: Category::Primary,
            attempt,
            result: SyncResult::Success,
        });
        assert_eq!(state.phase(Category::Primary), Phase::Success);
        assert_eq!(state.current(Category::Primary), Some(SyncResult::Success));
    }

    #[test]
    fn nothing_is_delivered_after_terminal_result() {
        let mut state = SyncState::new(Category::Primary);
        let attempt = begin(&mut state, Category::Primary);
        state.apply(Command::Fail {
            category: Category::Primary,
            attempt,
            reason: FailReason::NoNetwork,
        });

        let effects = state.apply(Command::Deliver {
            category: Category::Primary,
            attempt,
            result: SyncResult::Success,
        });
        assert!(matches!(effects.as_slice(), [Effect::Discarded(_)]));
        assert_eq!(
            state.current(Category::Primary),
            Some(SyncResult::fail(FailReason::NoNetwork))
        );
    }

    #[test]
    fn select_supersedes_previous_category() {
        let mut state = SyncState::new(Category::Primary);
        let attempt = begin(&mut state, Category::Primary);

        let effects = state.apply(Command::Select(Category::Secondary));
        assert_eq!(
            effects,
            vec![
                Effect::RetireDecoder(Category::Primary),
                Effect::Refresh(Category::Secondary)
            ]
        );
        assert_eq!(state.selected(), Category::Secondary);
        assert_eq!(state.phase(Category::Primary), Phase::Idle);
        assert!(!state.is_live(Category::Primary, attempt));

        let late = state.apply(Command::Deliver {
            category: Category::Primary,
            attempt,
            result: SyncResult::Success,
        });
        assert!(matches!(late.as_slice(), [Effect::Discarded(_)]));

        // A new refresh for the old category is admitted again.
        begin(&mut state, Category::Primary);
    }

    #[test]
    fn select_same_category_is_noop() {
        let mut state = SyncState::new(Category::Secondary);
        assert!(state.apply(Command::Select(Category::Secondary)).is_empty());
    }

    #[test]
    fn cached_available_only_fills_idle_entries() {
        let mut state = SyncState::new(Category::Primary);
        let effects = state.apply(Command::CachedAvailable(Category::Primary));
        assert_eq!(effects.len(), 1);
        assert_eq!(state.phase(Category::Primary), Phase::Success);

        begin(&mut state, Category::Secondary);
        assert!(state.apply(Command::CachedAvailable(Category::Secondary)).is_empty());
        assert_eq!(state.phase(Category::Secondary), Phase::Loading);
    }

    #[test]
    fn abandon_returns_to_idle_without_publishing() {
        let mut state = SyncState::new(Category::Primary);
        let attempt = begin(&mut state, Category::Primary);
        assert!(
            state
                .apply(Command::Abandon {
                    category: Category::Primary,
                    attempt
                })
                .is_empty()
        );
        assert_eq!(state.phase(Category::Primary), Phase::Idle);
    }

    #[test]
    fn content_changed_resets_everything() {
        let mut state = SyncState::new(Category::Secondary);
        let attempt = begin(&mut state, Category::Secondary);
        state.apply(Command::CachedAvailable(Category::Primary));

        let effects = state.apply(Command::ContentChanged);
        assert_eq!(
            effects,
            vec![
                Effect::RetireAllDecoders,
                Effect::ClearCache,
                Effect::Refresh(Category::Secondary)
            ]
        );
        assert_eq!(state.phase(Category::Primary), Phase::Idle);
        assert_eq!(state.phase(Category::Secondary), Phase::Idle);
        assert!(!state.is_live(Category::Secondary, attempt));
    }
}
