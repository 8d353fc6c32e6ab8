//! `Launch` — one execution attempt of a firework on a worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasks::FwAction;

use super::timestamp;
use super::{FWorker, FwId, FwState, LaunchId};

// ---------------------------------------------------------------------------
// State history
// ---------------------------------------------------------------------------

/// One entry of a launch's append-only state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: FwState,
    #[serde(with = "timestamp")]
    pub created_on: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_on: DateTime<Utc>,
    /// Queue reservation id; only ever present on RESERVED entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Trackers
// ---------------------------------------------------------------------------

fn default_nlines() -> usize {
    25
}

/// Tail of a file in the launch directory, captured when the launch ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    pub filename: String,
    #[serde(default = "default_nlines")]
    pub nlines: usize,
    #[serde(default)]
    pub content: String,
}

impl Tracker {
    pub fn new(filename: impl Into<String>, nlines: usize) -> Self {
        Self {
            filename: filename.into(),
            nlines,
            content: String::new(),
        }
    }

    /// Keep the last `nlines` lines of `text` as the tracked content.
    pub fn capture(&mut self, text: &str) {
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(self.nlines);
        self.content = lines[start..].join("\n");
    }
}

// ---------------------------------------------------------------------------
// Launch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Launch {
    pub fworker: FWorker,
    pub fw_id: FwId,
    #[serde(default)]
    pub launch_dir: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub trackers: Vec<Tracker>,
    /// Null until the launch reaches a terminal state.
    #[serde(default)]
    pub action: Option<FwAction>,
    pub state: FwState,
    #[serde(default)]
    pub state_history: Vec<StateHistoryEntry>,
    pub launch_id: LaunchId,
}

impl Launch {
    /// A fresh launch in RESERVED, as created by a claim.
    pub fn reserved(
        launch_id: LaunchId,
        fw_id: FwId,
        fworker: FWorker,
        reservation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut launch = Self {
            fworker,
            fw_id,
            launch_dir: None,
            host: None,
            ip: None,
            trackers: Vec::new(),
            action: None,
            state: FwState::Reserved,
            state_history: Vec::new(),
            launch_id,
        };
        launch.set_state(FwState::Reserved, now, Some(reservation_id.into()));
        launch
    }

    /// Rebuild a launch by re-applying a recorded history in order.
    ///
    /// Consecutive entries in the same state collapse into one, and
    /// reservation ids on non-RESERVED entries are dropped.
    pub fn replay(
        launch_id: LaunchId,
        fw_id: FwId,
        fworker: FWorker,
        history: &[StateHistoryEntry],
    ) -> Option<Self> {
        let first = history.first()?;
        let mut launch = Self {
            fworker,
            fw_id,
            launch_dir: None,
            host: None,
            ip: None,
            trackers: Vec::new(),
            action: None,
            state: first.state,
            state_history: Vec::new(),
            launch_id,
        };
        for entry in history {
            launch.set_state(entry.state, entry.created_on, entry.reservation_id.clone());
            if let Some(last) = launch.state_history.last_mut() {
                last.updated_on = entry.updated_on.max(last.created_on);
            }
        }
        Some(launch)
    }

    /// Move the launch to `state`.
    ///
    /// Re-setting the trailing state only refreshes that entry's
    /// `updated_on`; any other state appends a new entry. Returns whether an
    /// entry was appended.
    pub fn set_state(
        &mut self,
        state: FwState,
        now: DateTime<Utc>,
        reservation_id: Option<String>,
    ) -> bool {
        let reservation_id = reservation_id.filter(|_| state == FwState::Reserved);
        self.state = state;

        if let Some(last) = self.state_history.last_mut() {
            if last.state == state {
                last.updated_on = now;
                if reservation_id.is_some() {
                    last.reservation_id = reservation_id;
                }
                return false;
            }
        }

        self.state_history.push(StateHistoryEntry {
            state,
            created_on: now,
            updated_on: now,
            reservation_id,
        });
        true
    }

    /// Refresh the trailing entry without changing state (heartbeat).
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.state_history.last_mut() {
            last.updated_on = now;
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Reservation id of the most recent RESERVED entry.
    pub fn reservation_id(&self) -> Option<&str> {
        self.state_history
            .iter()
            .rev()
            .find(|entry| entry.state == FwState::Reserved)
            .and_then(|entry| entry.reservation_id.as_deref())
    }

    /// Replace the reservation id while the launch is still RESERVED.
    pub fn set_reservation_id(&mut self, reservation_id: impl Into<String>) -> bool {
        match self.state_history.last_mut() {
            Some(last) if last.state == FwState::Reserved && self.state == FwState::Reserved => {
                last.reservation_id = Some(reservation_id.into());
                true
            }
            _ => false,
        }
    }

    /// When the trailing history entry was last refreshed.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state_history.last().map(|entry| entry.updated_on)
    }

    /// Record the terminal action and state together.
    pub fn finish(&mut self, state: FwState, action: FwAction, now: DateTime<Utc>) {
        self.set_state(state, now, None);
        self.action = Some(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn launch() -> (Launch, DateTime<Utc>) {
        let t0 = timestamp::now();
        (Launch::reserved(1, 7, FWorker::default(), "abc", t0), t0)
    }

    #[test]
    fn same_state_refreshes_instead_of_appending() {
        let (mut l, t0) = launch();
        let later = t0 + Duration::seconds(5);

        assert!(!l.set_state(FwState::Reserved, later, None));
        assert_eq!(l.state_history.len(), 1);
        assert_eq!(l.state_history[0].created_on, t0);
        assert_eq!(l.state_history[0].updated_on, later);
        assert_eq!(l.reservation_id(), Some("abc"));
    }

    #[test]
    fn running_entry_never_carries_a_reservation_id() {
        let (mut l, t0) = launch();
        assert!(l.set_state(FwState::Running, t0, Some("leak".into())));
        assert_eq!(l.state_history.len(), 2);
        assert!(l.state_history[1].reservation_id.is_none());
    }

    #[test]
    fn reservation_id_is_replaceable_only_while_reserved() {
        let (mut l, t0) = launch();
        assert!(l.set_reservation_id("13055308"));
        assert_eq!(l.reservation_id(), Some("13055308"));

        l.set_state(FwState::Running, t0, None);
        assert!(!l.set_reservation_id("999"));
        assert_eq!(l.reservation_id(), Some("13055308"));
    }

    #[test]
    fn tracker_keeps_the_tail() {
        let mut tracker = Tracker::new("out.log", 2);
        tracker.capture("one\ntwo\nthree\n");
        assert_eq!(tracker.content, "two\nthree");
    }

    #[test]
    fn replay_collapses_repeated_states() {
        let (l, t0) = launch();
        let mut history = l.state_history.clone();
        history.push(StateHistoryEntry {
            state: FwState::Reserved,
            created_on: t0 + Duration::seconds(1),
            updated_on: t0 + Duration::seconds(2),
            reservation_id: None,
        });

        let replayed = Launch::replay(1, 7, FWorker::default(), &history).unwrap();
        assert_eq!(replayed.state_history.len(), 1);
        assert_eq!(replayed.reservation_id(), Some("abc"));
        assert!(Launch::replay(1, 7, FWorker::default(), &[]).is_none());
    }
}
