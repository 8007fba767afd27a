//! Per-vertex schedules: time-stamped actions and their ordering rules.
//!
//! Time is measured in seconds relative to the global barrier:
//! - `t < 0` (including `-inf`, "immediately"): configuration, grouped into
//!   local barrier buckets that run most-negative first
//! - `t == 0`: the first entries released by the global barrier
//! - `t > 0`: free-running, relative to the experiment start time
//!
//! Pause and break entries are nudged one representable step above their
//! authored time, so they always sort after ordinary entries at that time.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Index of an entry in its schedule's arena (also its insertion sequence).
pub type EntryId = u32;

/// Which vertices a resume targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeTargets {
    All,
    Vertices(Vec<String>),
}

impl ResumeTargets {
    pub fn includes(&self, vertex: &str) -> bool {
        match self {
            Self::All => true,
            Self::Vertices(names) => names.iter().any(|n| n == vertex),
        }
    }
}

/// Executable carried by a run action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutableRef {
    /// A program already present on the host
    Path(String),
    /// Program bytes shipped with the schedule, materialized before running
    Inline { name: String, bytes: Vec<u8> },
}

/// Closed set of actions a handler knows how to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    DropContent {
        path: String,
        content: Vec<u8>,
        mode: Option<u32>,
    },
    DropFile {
        source: PathBuf,
        dest: String,
    },
    RunExecutable {
        program: ExecutableRef,
        args: Vec<String>,
        timeout_seconds: Option<f64>,
    },
    Pause {
        duration: f64,
    },
    Break,
    ResumeMarker {
        targets: ResumeTargets,
    },
}

/// Discriminant of an [`Action`], for logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionKind {
    DropContent,
    DropFile,
    RunExecutable,
    Pause,
    Break,
    ResumeMarker,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::DropContent { .. } => ActionKind::DropContent,
            Self::DropFile { .. } => ActionKind::DropFile,
            Self::RunExecutable { .. } => ActionKind::RunExecutable,
            Self::Pause { .. } => ActionKind::Pause,
            Self::Break => ActionKind::Break,
            Self::ResumeMarker { .. } => ActionKind::ResumeMarker,
        }
    }

    /// Pause and break suspend the schedule itself.
    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::Pause { .. } | Self::Break)
    }

    /// Entries handled by the handler itself rather than an executor.
    pub fn is_control(&self) -> bool {
        self.is_suspension() || matches!(self, Self::ResumeMarker { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: EntryId,
    /// Time the entry sorts and executes at (after any nudge)
    pub start_time: f64,
    /// Time the entry was authored with
    pub authored_time: f64,
    pub action: Action,
}

impl ScheduleEntry {
    pub fn is_negative(&self) -> bool {
        self.start_time < 0.0
    }

    fn order_key(&self, other: &Self) -> Ordering {
        self.start_time
            .total_cmp(&other.start_time)
            .then(self.id.cmp(&other.id))
    }
}

/// Largest start time or pause duration a schedule accepts, in seconds.
///
/// Keeps every positive-time deadline within the range of wall-clock and
/// timer arithmetic.
pub const MAX_SCHEDULE_SECONDS: f64 = 1.0e9;

/// Smallest representable value strictly greater than `t`.
pub fn nudge_up(t: f64) -> f64 {
    if t.is_nan() || t == f64::INFINITY {
        return t;
    }
    if t == 0.0 {
        return f64::from_bits(1);
    }
    let bits = t.to_bits();
    if t > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

/// A local barrier bucket: every entry sharing one negative start time.
#[derive(Debug, Clone)]
pub struct Bucket<'a> {
    pub time: f64,
    pub entries: Vec<&'a ScheduleEntry>,
}

/// Ordered actions for one vertex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    owner: String,
    /// Arena in insertion order; `entries[i].id == i`
    entries: Vec<ScheduleEntry>,
    /// Arena indices sorted by (start_time, id)
    order: Vec<EntryId>,
}

impl Schedule {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            entries: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Rebuild a schedule from received entries, keeping their ids.
    pub fn from_entries(
        owner: impl Into<String>,
        entries: Vec<ScheduleEntry>,
    ) -> Result<Self, GraphError> {
        let mut schedule = Self::new(owner);
        for (idx, entry) in entries.iter().enumerate() {
            if entry.id as usize != idx {
                return Err(GraphError::InvalidStartTime {
                    vertex: schedule.owner.clone(),
                    time: entry.start_time,
                });
            }
            schedule.validate(entry.start_time, &entry.action)?;
        }
        schedule.entries = entries;
        schedule.order = (0..schedule.entries.len() as EntryId).collect();
        let entries = &schedule.entries;
        schedule
            .order
            .sort_by(|a, b| entries[*a as usize].order_key(&entries[*b as usize]));
        Ok(schedule)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&ScheduleEntry> {
        self.entries.get(id as usize)
    }

    /// Entries in insertion order, as shipped over the wire.
    pub fn arena(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    fn validate(&self, start_time: f64, action: &Action) -> Result<(), GraphError> {
        if start_time.is_nan() || start_time > MAX_SCHEDULE_SECONDS {
            return Err(GraphError::InvalidStartTime {
                vertex: self.owner.clone(),
                time: start_time,
            });
        }
        if let Action::Pause { duration } = action
            && !(*duration >= 0.0 && *duration <= MAX_SCHEDULE_SECONDS)
        {
            return Err(GraphError::InvalidDuration {
                vertex: self.owner.clone(),
                duration: *duration,
            });
        }
        Ok(())
    }

    /// Add an action at `start_time`.
    ///
    /// Pause and break entries are moved just above `start_time`, and further
    /// up while another suspension already occupies that exact time.
    pub fn schedule_action(
        &mut self,
        start_time: f64,
        action: Action,
    ) -> Result<EntryId, GraphError> {
        self.validate(start_time, &action)?;

        let effective = if action.is_suspension() {
            let mut t = nudge_up(start_time);
            while self
                .entries
                .iter()
                .any(|e| e.action.is_suspension() && e.start_time == t)
            {
                t = nudge_up(t);
            }
            t
        } else {
            start_time
        };
        self.validate(effective, &action)?;

        let id = self.entries.len() as EntryId;
        let entry = ScheduleEntry {
            id,
            start_time: effective,
            authored_time: start_time,
            action,
        };
        let entries = &self.entries;
        let slot = self
            .order
            .partition_point(|idx| entries[*idx as usize].order_key(&entry) == Ordering::Less);
        self.order.insert(slot, id);
        self.entries.push(entry);
        Ok(id)
    }

    /// Entries in execution order. Re-iterating yields the same sequence.
    pub fn iter(&self) -> impl Iterator<Item = &ScheduleEntry> + '_ {
        self.order.iter().map(|idx| &self.entries[*idx as usize])
    }

    /// Negative-time entries grouped by distinct start time, most negative first.
    pub fn negative_buckets(&self) -> Vec<Bucket<'_>> {
        let mut buckets: Vec<Bucket<'_>> = Vec::new();
        for entry in self.iter().take_while(|e| e.is_negative()) {
            match buckets.last_mut() {
                Some(bucket) if bucket.time == entry.start_time => bucket.entries.push(entry),
                _ => buckets.push(Bucket {
                    time: entry.start_time,
                    entries: vec![entry],
                }),
            }
        }
        buckets
    }

    /// Entries released by the global barrier (`t >= 0`), in order.
    pub fn positive_entries(&self) -> impl Iterator<Item = &ScheduleEntry> + '_ {
        self.iter().skip_while(|e| e.is_negative())
    }

    /// Effective start times of positive-time entries.
    ///
    /// `resumes` maps break entries to the experiment clock reading at which
    /// they were resumed. Entries behind an unresumed break have no effective
    /// time yet. This is a pure function of the authored entries and the
    /// resume observations.
    pub fn effective_times(&self, resumes: &BTreeMap<EntryId, f64>) -> Vec<(EntryId, Option<f64>)> {
        let mut timeline = Timeline::default();
        let mut blocked = false;
        let mut times = Vec::new();

        for entry in self.positive_entries() {
            if blocked {
                times.push((entry.id, None));
                continue;
            }
            let effective = timeline.effective(entry);
            times.push((entry.id, Some(effective)));
            match &entry.action {
                Action::Pause { duration } => timeline.apply_pause(*duration),
                Action::Break => match resumes.get(&entry.id) {
                    Some(resumed_at) => timeline.apply_resume(effective, *resumed_at),
                    None => blocked = true,
                },
                _ => {}
            }
        }
        times
    }
}

/// Accumulated shift applied to positive-time entries by pauses and breaks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timeline {
    offset: f64,
}

impl Timeline {
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Experiment-clock time an entry is due at.
    pub fn effective(&self, entry: &ScheduleEntry) -> f64 {
        entry.start_time + self.offset
    }

    pub fn apply_pause(&mut self, duration: f64) {
        self.offset += duration;
    }

    /// A break due at `break_effective` ended when the clock read `resumed_at`.
    pub fn apply_resume(&mut self, break_effective: f64, resumed_at: f64) {
        self.offset += (resumed_at - break_effective).max(0.0);
    }
}

/// Suspension state of one vertex, read by its handler to gate entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PauseState {
    pub active: bool,
    pub resume_at: Option<f64>,
    pub is_indefinite: bool,
}

impl PauseState {
    pub fn pause_until(&mut self, resume_at: f64) {
        *self = Self {
            active: true,
            resume_at: Some(resume_at),
            is_indefinite: false,
        };
    }

    pub fn enter_break(&mut self) {
        *self = Self {
            active: true,
            resume_at: None,
            is_indefinite: true,
        };
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// A resume only has an effect during an unbounded break.
    pub fn accepts_resume(&self) -> bool {
        self.active && self.is_indefinite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(cmd: &str) -> Action {
        Action::RunExecutable {
            program: ExecutableRef::Path(cmd.to_string()),
            args: Vec::new(),
            timeout_seconds: None,
        }
    }

    #[test]
    fn nudge_moves_one_step_up() {
        assert!(nudge_up(15.0) > 15.0);
        assert!(nudge_up(-1.0) > -1.0);
        assert!(nudge_up(-1.0) < -0.999_999);
        assert!(nudge_up(0.0) > 0.0);
        assert_eq!(nudge_up(f64::NEG_INFINITY), f64::MIN);
    }

    #[test]
    fn suspensions_sort_after_entries_at_the_same_time() {
        let mut schedule = Schedule::new("h1");
        let pause = schedule.schedule_action(10.0, Action::Pause { duration: 5.0 }).unwrap();
        let late = schedule.schedule_action(10.0, run("late")).unwrap();
        let early = schedule.schedule_action(5.0, run("early")).unwrap();

        let ids: Vec<EntryId> = schedule.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![early, late, pause]);
        // restartable
        assert_eq!(schedule.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
    }

    #[test]
    fn colliding_suspensions_compound_the_nudge() {
        let mut schedule = Schedule::new("h1");
        let first = schedule.schedule_action(10.0, Action::Break).unwrap();
        let second = schedule.schedule_action(10.0, Action::Pause { duration: 1.0 }).unwrap();
        let a = schedule.get(first).unwrap().start_time;
        let b = schedule.get(second).unwrap().start_time;
        assert_eq!(a, nudge_up(10.0));
        assert_eq!(b, nudge_up(a));
        assert_eq!(schedule.get(second).unwrap().authored_time, 10.0);
    }

    #[test]
    fn negative_buckets_group_by_time() {
        let mut schedule = Schedule::new("h1");
        schedule.schedule_action(-5.0, run("b")).unwrap();
        schedule.schedule_action(f64::NEG_INFINITY, run("a")).unwrap();
        schedule.schedule_action(-5.0, run("c")).unwrap();
        schedule.schedule_action(-1.0, run("d")).unwrap();
        schedule.schedule_action(0.0, run("e")).unwrap();
        schedule.schedule_action(3.0, run("f")).unwrap();

        let buckets = schedule.negative_buckets();
        let times: Vec<f64> = buckets.iter().map(|b| b.time).collect();
        assert_eq!(times, vec![f64::NEG_INFINITY, -5.0, -1.0]);
        assert_eq!(buckets[1].entries.len(), 2);
        assert_eq!(schedule.positive_entries().count(), 2);
    }

    #[test]
    fn invalid_times_and_durations_are_rejected() {
        let mut schedule = Schedule::new("h1");
        assert!(schedule.schedule_action(f64::NAN, run("x")).is_err());
        assert!(schedule.schedule_action(f64::INFINITY, run("x")).is_err());
        assert!(
            schedule
                .schedule_action(1.0, Action::Pause { duration: -1.0 })
                .is_err()
        );
        assert!(schedule.is_empty());
    }

    #[test]
    fn out_of_range_times_and_durations_are_rejected() {
        let mut schedule = Schedule::new("h1");
        assert!(matches!(
            schedule.schedule_action(1e13, run("far")),
            Err(GraphError::InvalidStartTime { .. })
        ));
        assert!(matches!(
            schedule.schedule_action(-1.0, Action::Pause { duration: 1e20 }),
            Err(GraphError::InvalidDuration { .. })
        ));
        assert!(matches!(
            schedule.schedule_action(MAX_SCHEDULE_SECONDS, Action::Break),
            Err(GraphError::InvalidStartTime { .. })
        ));
        assert!(schedule.is_empty());

        schedule.schedule_action(MAX_SCHEDULE_SECONDS, run("edge")).unwrap();
        schedule
            .schedule_action(-1e300, Action::Pause { duration: MAX_SCHEDULE_SECONDS })
            .unwrap();
        assert_eq!(schedule.len(), 2);
    }

    #[test]
    fn break_then_resume_rebases_later_entries() {
        let mut schedule = Schedule::new("h1");
        let entry = schedule.schedule_action(30.0, run("check")).unwrap();
        let brk = schedule.schedule_action(15.0, Action::Break).unwrap();

        let unresolved = schedule.effective_times(&BTreeMap::new());
        assert_eq!(unresolved.last(), Some(&(entry, None)));

        let resumes = BTreeMap::from([(brk, 1000.0)]);
        let times: BTreeMap<EntryId, Option<f64>> =
            schedule.effective_times(&resumes).into_iter().collect();
        let effective = times[&entry].unwrap();
        assert!((effective - 1015.0).abs() < 1e-9);
    }

    #[test]
    fn pauses_and_breaks_compose_on_effective_times() {
        let mut schedule = Schedule::new("h1");
        schedule.schedule_action(10.0, Action::Pause { duration: 5.0 }).unwrap();
        let brk = schedule.schedule_action(20.0, Action::Break).unwrap();
        let entry = schedule.schedule_action(40.0, run("late")).unwrap();
        let mid = schedule.schedule_action(12.0, run("mid")).unwrap();

        // break is due at 25 (shifted by the pause); resumed at 100 -> +75
        let resumes = BTreeMap::from([(brk, 100.0)]);
        let times: BTreeMap<EntryId, Option<f64>> =
            schedule.effective_times(&resumes).into_iter().collect();
        assert!((times[&mid].unwrap() - 17.0).abs() < 1e-9);
        assert!((times[&brk].unwrap() - 25.0).abs() < 1e-9);
        assert!((times[&entry].unwrap() - 120.0).abs() < 1e-9);

        // re-deriving gives identical results
        let again: BTreeMap<EntryId, Option<f64>> =
            schedule.effective_times(&resumes).into_iter().collect();
        assert_eq!(times, again);
    }

    #[test]
    fn from_entries_restores_order() {
        let mut schedule = Schedule::new("h1");
        schedule.schedule_action(3.0, run("b")).unwrap();
        schedule.schedule_action(-2.0, run("a")).unwrap();
        schedule.schedule_action(3.0, Action::Break).unwrap();

        let rebuilt = Schedule::from_entries("h1", schedule.arena().to_vec()).unwrap();
        assert_eq!(rebuilt, schedule);
    }

    #[test]
    fn pause_state_only_accepts_resume_in_break() {
        let mut state = PauseState::default();
        assert!(!state.accepts_resume());
        state.pause_until(12.0);
        assert!(!state.accepts_resume());
        state.enter_break();
        assert!(state.accepts_resume());
        state.clear();
        assert!(!state.active);
    }
}
