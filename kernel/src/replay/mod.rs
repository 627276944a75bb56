// History Replay Engine
//
// Drains a history topic from its first entry and hands every parsable
// record to a sink, in log order. A log has no end-of-data marker, so
// the drain stops once the log has been quiet for a number of polls.

use std::time::Duration;

use crate::broker::LogConsumer;
use crate::log::HistoryRecord;

/// Quiescence state of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Still polling; `remaining` empty polls are tolerated before stopping.
    Active { remaining: u32 },
    /// The log is considered fully consumed.
    Done,
}

/// Empty-poll budget that decides when a replay is complete.
///
/// Every poll that yields entries restores the full budget, so a replay
/// only ends after `max_attempts` consecutive empty polls.
#[derive(Debug, Clone)]
pub struct RecoveryBudget {
    max_attempts: u32,
    state: RecoveryState,
}

impl RecoveryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            state: Self::full(max_attempts),
        }
    }

    fn full(max_attempts: u32) -> RecoveryState {
        if max_attempts == 0 {
            RecoveryState::Done
        } else {
            RecoveryState::Active {
                remaining: max_attempts,
            }
        }
    }

    /// Feed the size of one poll result and return the new state.
    pub fn observe(&mut self, polled: usize) -> RecoveryState {
        self.state = match self.state {
            RecoveryState::Done => RecoveryState::Done,
            RecoveryState::Active { .. } if polled > 0 => Self::full(self.max_attempts),
            RecoveryState::Active { remaining } if remaining <= 1 => RecoveryState::Done,
            RecoveryState::Active { remaining } => RecoveryState::Active {
                remaining: remaining - 1,
            },
        };
        self.state
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == RecoveryState::Done
    }
}

/// Knobs for one replay.
#[derive(Debug, Clone, Copy)]
pub struct ReplaySettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

/// What a replay saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub polls: u64,
    pub entries: u64,
    pub recovered: u64,
    pub skipped: u64,
}

/// Poll `consumer` until the log goes quiet, passing each record to `sink`.
///
/// Malformed entries are logged and skipped. A failed poll is logged and
/// counted as an empty one, so a dead broker still ends the replay.
pub fn replay_history<C, F>(
    consumer: &mut C,
    settings: ReplaySettings,
    mut sink: F,
) -> ReplaySummary
where
    C: LogConsumer + ?Sized,
    F: FnMut(HistoryRecord),
{
    let mut summary = ReplaySummary::default();
    let mut budget = RecoveryBudget::new(settings.max_attempts);

    while !budget.is_done() {
        let entries = match consumer.poll(settings.poll_interval) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "poll of database history failed");
                Vec::new()
            }
        };
        summary.polls += 1;
        tracing::debug!("Read {} records from database history", entries.len());

        let polled = entries.len();
        for entry in entries {
            summary.entries += 1;
            match HistoryRecord::parse(&entry.payload) {
                Ok(record) => {
                    tracing::trace!(%record, "Recovered database history");
                    sink(record);
                    summary.recovered += 1;
                }
                Err(err) => {
                    tracing::error!(
                        partition = entry.partition,
                        offset = entry.offset,
                        error = %err,
                        "Error while deserializing history record"
                    );
                    summary.skipped += 1;
                }
            }
        }

        budget.observe(polled);
    }

    summary
}
