//! Election-day phases and the resources each phase syncs.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use servel_core::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    BeforeOpen,
    Installation,
    Voting,
    Tally,
    /// Smart scheduling is off: every tick syncs everything.
    Disabled,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::BeforeOpen => "before-open",
            Phase::Installation => "installation",
            Phase::Voting => "voting",
            Phase::Tally => "tally",
            Phase::Disabled => "disabled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a cycle fans out concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// No full cycle has completed since startup; resources run one after another.
    ColdStart,
    Warm,
}

impl SyncMode {
    pub fn from_history(completed_full_cycle: bool) -> Self {
        if completed_full_cycle {
            SyncMode::Warm
        } else {
            SyncMode::ColdStart
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::ColdStart => "cold-start",
            SyncMode::Warm => "warm",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseWindows {
    pub smart: bool,
    pub timezone: Tz,
    /// Outside this date the day is either not started or fully in tally.
    pub election_date: Option<NaiveDate>,
    pub installation_start: NaiveTime,
    pub voting_start: NaiveTime,
    pub tally_start: NaiveTime,
}

impl Default for PhaseWindows {
    fn default() -> Self {
        Self {
            smart: true,
            timezone: chrono_tz::America::Santiago,
            election_date: None,
            installation_start: clock(7, 0),
            voting_start: clock(8, 0),
            tally_start: clock(18, 0),
        }
    }
}

fn clock(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl PhaseWindows {
    pub fn phase_at(&self, now: DateTime<Utc>) -> Phase {
        if !self.smart {
            return Phase::Disabled;
        }
        let local = now.with_timezone(&self.timezone);
        if let Some(date) = self.election_date {
            let today = local.date_naive();
            if today < date {
                return Phase::BeforeOpen;
            }
            if today > date {
                return Phase::Tally;
            }
        }

        let time = local.time();
        if time < self.installation_start {
            Phase::BeforeOpen
        } else if time < self.voting_start {
            Phase::Installation
        } else if time < self.tally_start {
            Phase::Voting
        } else {
            Phase::Tally
        }
    }
}

/// Resources a tick in `phase` should sync, in catalog order.
pub fn select_resources(phase: Phase, catalog: &[ResourceKey], installation_latched: bool) -> Vec<ResourceKey> {
    match phase {
        Phase::BeforeOpen => Vec::new(),
        Phase::Installation | Phase::Voting if installation_latched => Vec::new(),
        Phase::Installation | Phase::Voting => catalog
            .iter()
            .copied()
            .filter(|key| *key == ResourceKey::Installation)
            .collect(),
        Phase::Tally | Phase::Disabled => catalog.to_vec(),
    }
}

/// Parses `HH:MM` or `HH:MM:SS` wall-clock times.
pub fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use servel_core::Election;

    fn santiago(date: (i32, u32, u32), hour: u32, minute: u32) -> DateTime<Utc> {
        chrono_tz::America::Santiago
            .with_ymd_and_hms(date.0, date.1, date.2, hour, minute, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn catalog() -> Vec<ResourceKey> {
        ResourceKey::catalog(&[Election::Presidential, Election::Deputies])
    }

    #[test]
    fn mid_installation_window_selects_only_installation() {
        let windows = PhaseWindows {
            installation_start: parse_clock("08:00").unwrap(),
            voting_start: parse_clock("12:00").unwrap(),
            ..PhaseWindows::default()
        };
        let phase = windows.phase_at(santiago((2025, 11, 16), 10, 0));

        assert_eq!(phase, Phase::Installation);
        assert_eq!(select_resources(phase, &catalog(), false), vec![ResourceKey::Installation]);
    }

    #[test]
    fn evening_after_tally_start_selects_everything() {
        let windows = PhaseWindows::default();
        let phase = windows.phase_at(santiago((2025, 11, 16), 19, 0));

        assert_eq!(phase, Phase::Tally);
        assert_eq!(select_resources(phase, &catalog(), true), catalog());
    }

    #[test]
    fn boundaries_are_inclusive_at_their_start() {
        let windows = PhaseWindows::default();
        let day = (2025, 11, 16);
        assert_eq!(windows.phase_at(santiago(day, 6, 59)), Phase::BeforeOpen);
        assert_eq!(windows.phase_at(santiago(day, 7, 0)), Phase::Installation);
        assert_eq!(windows.phase_at(santiago(day, 8, 0)), Phase::Voting);
        assert_eq!(windows.phase_at(santiago(day, 18, 0)), Phase::Tally);
    }

    #[test]
    fn election_date_pins_other_days() {
        let windows = PhaseWindows {
            election_date: NaiveDate::from_ymd_opt(2025, 11, 16),
            ..PhaseWindows::default()
        };
        assert_eq!(windows.phase_at(santiago((2025, 11, 15), 20, 0)), Phase::BeforeOpen);
        assert_eq!(windows.phase_at(santiago((2025, 11, 17), 3, 0)), Phase::Tally);
        assert_eq!(windows.phase_at(santiago((2025, 11, 16), 9, 0)), Phase::Voting);
    }

    #[test]
    fn latch_and_closed_phases_select_nothing() {
        assert!(select_resources(Phase::BeforeOpen, &catalog(), false).is_empty());
        assert!(select_resources(Phase::Voting, &catalog(), true).is_empty());
    }

    #[test]
    fn disabled_scheduling_ignores_the_clock() {
        let windows = PhaseWindows {
            smart: false,
            ..PhaseWindows::default()
        };
        let phase = windows.phase_at(santiago((2025, 11, 16), 3, 0));
        assert_eq!(phase, Phase::Disabled);
        assert_eq!(select_resources(phase, &catalog(), true).len(), 6);
    }

    #[test]
    fn clock_parsing() {
        assert_eq!(parse_clock("07:30"), NaiveTime::from_hms_opt(7, 30, 0));
        assert_eq!(parse_clock(" 18:00:15 "), NaiveTime::from_hms_opt(18, 0, 15));
        assert_eq!(parse_clock("7h"), None);
    }
}
