//! Timetable allocation engine.
//!
//! An [`EditingSession`] is a working copy of one class-section's weekly grid
//! together with a shadow of every teacher's availability. Assignments are
//! checked against the mapping quota, the cell itself and the shadow; a
//! cross-class clash pauses the cell until the caller cancels or overrides.
//! Nothing reaches the store until [`EditingSession::stage_save`] passes the
//! authoritative re-check, and the session itself only moves forward once
//! [`EditingSession::finish_save`] is handed the committed result.

use crate::availability::{self, AvailabilityIndex, BookingsByTeacher};
use crate::model::{Booking, ClassSection, Entry, Grid, Mapping, TimetableSettings};
use crate::store::{AvailabilityStore, GridStore, TimetableStore};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot open timetable: {0}")]
    ContextLoad(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("no mapping for subject {subject_id} and teacher {teacher_id} in {class_section}")]
    UnknownMapping {
        class_section: ClassSection,
        subject_id: String,
        teacher_id: String,
    },

    #[error("no conflict is awaiting a decision")]
    NoPendingConflict,

    #[error("grid is malformed: {0}")]
    InvalidGrid(String),

    #[error("teacher {teacher_id} is already booked in {conflicting_class} on {day} period {period}")]
    PersistConflict {
        teacher_id: String,
        day: String,
        period: u32,
        conflicting_class: ClassSection,
    },

    #[error(transparent)]
    Adapter(#[from] anyhow::Error),
}

/// Where an assignment lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Cell { day: String, period: u32 },
    /// The same period on every working day.
    AllDays { period: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub teacher_id: String,
    pub day: String,
    pub period: u32,
    pub conflicting_class: ClassSection,
    pub conflicting_subject_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SkipReason {
    #[serde(rename_all = "camelCase")]
    Conflict { conflicting_class: ClassSection },
    QuotaExceeded,
    LocalDuplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDay {
    pub day: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllDaysReport {
    pub period: u32,
    pub applied: Vec<String>,
    pub skipped: Vec<SkippedDay>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AssignResult {
    Applied {
        day: String,
        period: u32,
        entry: Entry,
    },
    QuotaExceeded {
        used: usize,
        limit: u32,
    },
    #[serde(rename_all = "camelCase")]
    LocalDuplicate {
        day: String,
        period: u32,
        teacher_id: String,
    },
    CrossClassConflict(Conflict),
    AllDays(AllDaysReport),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Cancel,
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RemoveOutcome {
    Removed { entry: Entry },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAssignment {
    pub entry: Entry,
    pub conflict: Conflict,
    /// Raised by the save re-check against an entry the grid already holds.
    pub in_grid: bool,
}

/// Interaction state of the cell being edited.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CellState {
    #[default]
    Idle,
    SelectingMapping {
        day: String,
        period: u32,
    },
    ConflictDetected(PendingAssignment),
    Applied(Target),
    Cancelled,
}

impl CellState {
    pub fn name(&self) -> &'static str {
        match self {
            CellState::Idle => "idle",
            CellState::SelectingMapping { .. } => "selectingMapping",
            CellState::ConflictDetected(_) => "conflictDetected",
            CellState::Applied(_) => "applied",
            CellState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingUsage {
    #[serde(flatten)]
    pub mapping: Mapping,
    pub used: usize,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
    pub revision: String,
    pub entries: usize,
    pub teachers: Vec<String>,
    pub overwrote_concurrent_edit: bool,
}

/// Writes done by [`EditingSession::stage_save`], waiting for the store to
/// commit them before the session adopts the new revision.
#[derive(Debug)]
#[must_use]
pub struct StagedSave {
    result: SaveResult,
    refreshed: BookingsByTeacher,
}

/// A cross-class booking the caller explicitly overrode in this session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OverrideAck {
    teacher_id: String,
    day: String,
    period: u32,
    class_section: ClassSection,
}

#[derive(Debug)]
pub struct EditingSession {
    class_section: ClassSection,
    settings: TimetableSettings,
    mappings: Vec<Mapping>,
    grid: Grid,
    shadow: AvailabilityIndex,
    cell: CellState,
    overrides: Vec<OverrideAck>,
    loaded_revision: Option<String>,
}

impl EditingSession {
    pub fn load<S>(store: &S, class_section: ClassSection) -> Result<Self, EngineError>
    where
        S: TimetableStore + ?Sized,
    {
        let settings = store.timetable_settings()?.ok_or_else(|| {
            EngineError::ContextLoad("timetable settings have not been configured".to_string())
        })?;
        if !settings.is_bounded() {
            return Err(EngineError::ContextLoad(
                "working days and total periods must be configured".to_string(),
            ));
        }
        if !store.class_section_exists(&class_section)? {
            return Err(EngineError::ContextLoad(format!(
                "unknown class section {}",
                class_section
            )));
        }

        let loaded_revision = store.grid_revision(&class_section)?;
        let mut grid = store.grid(&class_section)?.unwrap_or_default();
        grid.sort_slots();
        grid.ensure_days(&settings.working_days);

        let mappings = store.mappings(&class_section)?;
        let teacher_ids = store.teacher_ids()?;
        let shadow = AvailabilityIndex::new(store.load_all(&teacher_ids)?);

        info!(
            "opened timetable {} ({} entries, {} mappings, {} teachers)",
            class_section,
            grid.entry_count(),
            mappings.len(),
            teacher_ids.len()
        );

        Ok(Self {
            class_section,
            settings,
            mappings,
            grid,
            shadow,
            cell: CellState::Idle,
            overrides: Vec::new(),
            loaded_revision,
        })
    }

    pub fn class_section(&self) -> &ClassSection {
        &self.class_section
    }

    pub fn settings(&self) -> &TimetableSettings {
        &self.settings
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    #[cfg(test)]
    pub fn shadow(&self) -> &AvailabilityIndex {
        &self.shadow
    }

    pub fn cell(&self) -> &CellState {
        &self.cell
    }

    pub fn loaded_revision(&self) -> Option<&str> {
        self.loaded_revision.as_deref()
    }

    pub fn pending_conflict(&self) -> Option<&Conflict> {
        match &self.cell {
            CellState::ConflictDetected(p) => Some(&p.conflict),
            _ => None,
        }
    }

    /// Recomputed from the grid on every call.
    pub fn usage_count(&self, subject_id: &str, teacher_id: &str) -> usize {
        self.grid.count(subject_id, teacher_id)
    }

    pub fn usage(&self) -> Vec<MappingUsage> {
        self.mappings
            .iter()
            .map(|m| {
                let used = self.usage_count(&m.subject_id, &m.teacher_id);
                MappingUsage {
                    mapping: m.clone(),
                    used,
                    remaining: m.periods_per_week.saturating_sub(used as u32),
                }
            })
            .collect()
    }

    pub fn mapping(&self, subject_id: &str, teacher_id: &str) -> Result<&Mapping, EngineError> {
        self.mappings
            .iter()
            .find(|m| m.is_for(subject_id, teacher_id))
            .ok_or_else(|| EngineError::UnknownMapping {
                class_section: self.class_section.clone(),
                subject_id: subject_id.to_string(),
                teacher_id: teacher_id.to_string(),
            })
    }

    /// Opens a cell for mapping selection. Any conflict still awaiting a
    /// decision is cancelled.
    pub fn select(&mut self, day: &str, period: u32) -> Result<(), EngineError> {
        self.check_cell(day, period)?;
        self.discard_pending();
        self.cell = CellState::SelectingMapping {
            day: day.to_string(),
            period,
        };
        Ok(())
    }

    pub fn assign(
        &mut self,
        target: &Target,
        subject_id: &str,
        teacher_id: &str,
    ) -> Result<AssignResult, EngineError> {
        let mapping = self.mapping(subject_id, teacher_id)?.clone();
        match target {
            Target::Cell { day, period } => {
                self.check_cell(day, *period)?;
                self.discard_pending();

                let result = self.try_apply(&mapping, day, *period);
                self.cell = match &result {
                    AssignResult::Applied { .. } => CellState::Applied(target.clone()),
                    AssignResult::CrossClassConflict(conflict) => {
                        debug!(
                            "{}: teacher {} clashes with {} on {} period {}",
                            self.class_section,
                            conflict.teacher_id,
                            conflict.conflicting_class,
                            conflict.day,
                            conflict.period
                        );
                        CellState::ConflictDetected(PendingAssignment {
                            entry: Entry::new(
                                mapping.subject_id.clone(),
                                mapping.teacher_id.clone(),
                            ),
                            conflict: conflict.clone(),
                            in_grid: false,
                        })
                    }
                    _ => CellState::SelectingMapping {
                        day: day.clone(),
                        period: *period,
                    },
                };
                Ok(result)
            }
            Target::AllDays { period } => {
                if !self.settings.has_period(*period) {
                    return Err(self.period_out_of_range(*period));
                }
                self.discard_pending();

                let mut report = AllDaysReport {
                    period: *period,
                    applied: Vec::new(),
                    skipped: Vec::new(),
                };
                let days = self.settings.working_days.clone();
                for day in days {
                    let reason = match self.try_apply(&mapping, &day, *period) {
                        AssignResult::Applied { .. } => {
                            report.applied.push(day);
                            continue;
                        }
                        AssignResult::CrossClassConflict(c) => SkipReason::Conflict {
                            conflicting_class: c.conflicting_class,
                        },
                        AssignResult::LocalDuplicate { .. } => SkipReason::LocalDuplicate,
                        _ => SkipReason::QuotaExceeded,
                    };
                    report.skipped.push(SkippedDay { day, reason });
                }
                if !report.skipped.is_empty() {
                    debug!(
                        "{}: all-days assignment of period {} skipped {} day(s)",
                        self.class_section,
                        period,
                        report.skipped.len()
                    );
                }
                self.cell = if report.applied.is_empty() {
                    CellState::Idle
                } else {
                    CellState::Applied(target.clone())
                };
                Ok(AssignResult::AllDays(report))
            }
        }
    }

    pub fn resolve_conflict(&mut self, decision: Decision) -> Result<AssignResult, EngineError> {
        let pending = match std::mem::take(&mut self.cell) {
            CellState::ConflictDetected(p) => p,
            other => {
                self.cell = other;
                return Err(EngineError::NoPendingConflict);
            }
        };

        match decision {
            Decision::Cancel => {
                self.cell = CellState::Cancelled;
                Ok(AssignResult::Cancelled)
            }
            Decision::Override => {
                let PendingAssignment {
                    entry,
                    conflict,
                    in_grid,
                } = pending;
                let (day, period) = (conflict.day.as_str(), conflict.period);

                if in_grid {
                    // Raised at save; the entry is already placed.
                    if !self
                        .grid
                        .slot(day, period)
                        .is_some_and(|s| s.has_teacher(&entry.teacher_id))
                    {
                        self.cell = CellState::Cancelled;
                        return Ok(AssignResult::Cancelled);
                    }
                    self.acknowledge(&entry.teacher_id, day, period);
                    self.cell = CellState::Applied(Target::Cell {
                        day: day.to_string(),
                        period,
                    });
                    return Ok(AssignResult::Applied {
                        day: day.to_string(),
                        period,
                        entry,
                    });
                }

                let mapping = match self.mapping(&entry.subject_id, &entry.teacher_id) {
                    Ok(m) => m.clone(),
                    Err(e) => {
                        self.cell = CellState::Cancelled;
                        return Err(e);
                    }
                };
                // The grid may have changed since the conflict was raised.
                if let Some(rejected) = self.check_local(&mapping, day, period) {
                    self.cell = CellState::SelectingMapping {
                        day: day.to_string(),
                        period,
                    };
                    return Ok(rejected);
                }

                self.acknowledge(&mapping.teacher_id, day, period);
                let result = self.apply(&mapping, day, period);
                self.cell = CellState::Applied(Target::Cell {
                    day: day.to_string(),
                    period,
                });
                Ok(result)
            }
        }
    }

    pub fn remove_entry(&mut self, day: &str, period: u32, index: usize) -> RemoveOutcome {
        let Some(slot) = self.grid.slot_mut(day, period) else {
            return RemoveOutcome::NotFound;
        };
        if index >= slot.entries.len() {
            return RemoveOutcome::NotFound;
        }
        let entry = slot.entries.remove(index);
        if !self.shadow.remove_one(
            &entry.teacher_id,
            day,
            period,
            &self.class_section,
            &entry.subject_id,
        ) {
            debug!(
                "{}: no shadow booking for teacher {} on {} period {}",
                self.class_section, entry.teacher_id, day, period
            );
        }
        RemoveOutcome::Removed { entry }
    }

    /// Writes the grid and this class-section's bookings.
    ///
    /// Every booking the grid implies is checked against the store's current
    /// availability documents first; a clash the session did not explicitly
    /// override aborts the save before anything is written. That clash is
    /// folded into the shadow and left pending on the cell, so the caller can
    /// cancel or override it like any other conflict.
    ///
    /// The session's revision and shadow are untouched until the staged result
    /// goes through [`EditingSession::finish_save`]. Dropping it, for example
    /// because the store transaction failed to commit, leaves the session as
    /// it was.
    pub fn stage_save<S>(&mut self, store: &S) -> Result<StagedSave, EngineError>
    where
        S: GridStore + AvailabilityStore + ?Sized,
    {
        self.grid.validate().map_err(EngineError::InvalidGrid)?;

        let mut wanted = availability::bookings_from_grid(&self.class_section, &self.grid);
        for (teacher_id, bookings) in &wanted {
            let authoritative = store.teacher_bookings(teacher_id)?;
            for b in bookings {
                let clash = authoritative
                    .iter()
                    .find(|a| {
                        a.at(&b.day, b.period)
                            && !a.belongs_to(&self.class_section)
                            && !self.is_acknowledged(teacher_id, a)
                    })
                    .cloned();
                if let Some(a) = clash {
                    warn!(
                        "{}: save rejected, teacher {} is booked in {}_{} on {} period {}",
                        self.class_section, teacher_id, a.class_id, a.section_id, a.day, a.period
                    );
                    return Err(self.hold_persist_conflict(teacher_id, a));
                }
            }
        }

        let stored_revision = store.grid_revision(&self.class_section)?;
        let overwrote_concurrent_edit =
            stored_revision.is_some() && stored_revision != self.loaded_revision;
        if overwrote_concurrent_edit {
            warn!(
                "{}: grid changed in the store since it was opened; overwriting",
                self.class_section
            );
        }

        // Teachers dropped from the grid still need their old bookings cleared.
        for teacher_id in store.teachers_booked_for(&self.class_section)? {
            wanted.entry(teacher_id).or_default();
        }

        store.save_grid(&self.class_section, &self.grid)?;
        store.replace_for_class_section(&self.class_section, &wanted)?;

        let mut refreshed = BookingsByTeacher::new();
        for teacher_id in wanted.keys() {
            let mut bookings = store.teacher_bookings(teacher_id)?;
            bookings.retain(|b| !self.is_acknowledged(teacher_id, b));
            refreshed.insert(teacher_id.clone(), bookings);
        }

        Ok(StagedSave {
            result: SaveResult {
                revision: self.grid.revision(),
                entries: self.grid.entry_count(),
                teachers: wanted.keys().cloned().collect(),
                overwrote_concurrent_edit,
            },
            refreshed,
        })
    }

    /// Adopts a save the store has committed.
    pub fn finish_save(&mut self, staged: StagedSave) -> SaveResult {
        let StagedSave { result, refreshed } = staged;
        for (teacher_id, bookings) in refreshed {
            self.shadow.set_teacher(&teacher_id, bookings);
        }
        self.loaded_revision = Some(result.revision.clone());
        info!(
            "saved timetable {} ({} entries, {} teachers)",
            self.class_section,
            result.entries,
            result.teachers.len()
        );
        result
    }

    /// Stage and finish in one step, for stores that need no commit.
    #[cfg(test)]
    pub fn save<S>(&mut self, store: &S) -> Result<SaveResult, EngineError>
    where
        S: GridStore + AvailabilityStore + ?Sized,
    {
        let staged = self.stage_save(store)?;
        Ok(self.finish_save(staged))
    }

    /// Makes a clash found by the save re-check visible to the session and
    /// parks it on the cell for a decision.
    fn hold_persist_conflict(&mut self, teacher_id: &str, clash: Booking) -> EngineError {
        let conflict = Conflict {
            teacher_id: teacher_id.to_string(),
            day: clash.day.clone(),
            period: clash.period,
            conflicting_class: clash.class_section(),
            conflicting_subject_id: clash.subject_id.clone(),
        };
        let entry = self
            .grid
            .slot(&clash.day, clash.period)
            .and_then(|s| s.entries.iter().find(|e| e.teacher_id == teacher_id))
            .cloned();
        if !self.shadow.bookings(teacher_id).contains(&clash) {
            self.shadow.add(teacher_id, clash);
        }
        if let Some(entry) = entry {
            self.cell = CellState::ConflictDetected(PendingAssignment {
                entry,
                conflict: conflict.clone(),
                in_grid: true,
            });
        }
        EngineError::PersistConflict {
            teacher_id: conflict.teacher_id,
            day: conflict.day,
            period: conflict.period,
            conflicting_class: conflict.conflicting_class,
        }
    }

    fn try_apply(&mut self, mapping: &Mapping, day: &str, period: u32) -> AssignResult {
        if let Some(rejected) = self.check_local(mapping, day, period) {
            return rejected;
        }
        if let Some(b) =
            self.shadow
                .find_conflict(&mapping.teacher_id, day, period, &self.class_section)
        {
            return AssignResult::CrossClassConflict(Conflict {
                teacher_id: mapping.teacher_id.clone(),
                day: day.to_string(),
                period,
                conflicting_class: b.class_section(),
                conflicting_subject_id: b.subject_id.clone(),
            });
        }
        self.apply(mapping, day, period)
    }

    /// Quota and same-cell checks, which need nothing outside this grid.
    fn check_local(&self, mapping: &Mapping, day: &str, period: u32) -> Option<AssignResult> {
        let used = self.usage_count(&mapping.subject_id, &mapping.teacher_id);
        if used >= mapping.periods_per_week as usize {
            return Some(AssignResult::QuotaExceeded {
                used,
                limit: mapping.periods_per_week,
            });
        }
        if self
            .grid
            .slot(day, period)
            .is_some_and(|s| s.has_teacher(&mapping.teacher_id))
        {
            return Some(AssignResult::LocalDuplicate {
                day: day.to_string(),
                period,
                teacher_id: mapping.teacher_id.clone(),
            });
        }
        None
    }

    fn apply(&mut self, mapping: &Mapping, day: &str, period: u32) -> AssignResult {
        let entry = Entry::new(mapping.subject_id.clone(), mapping.teacher_id.clone());
        self.grid
            .slot_or_insert(day, period)
            .entries
            .push(entry.clone());
        self.shadow.add(
            &mapping.teacher_id,
            Booking {
                day: day.to_string(),
                period,
                class_id: self.class_section.class_id.clone(),
                section_id: self.class_section.section_id.clone(),
                subject_id: mapping.subject_id.clone(),
            },
        );
        AssignResult::Applied {
            day: day.to_string(),
            period,
            entry,
        }
    }

    /// Drops other classes' bookings at this cell from the shadow and records
    /// each one as overridden.
    fn acknowledge(&mut self, teacher_id: &str, day: &str, period: u32) {
        let evicted = self
            .shadow
            .evict_conflicts(teacher_id, day, period, &self.class_section);
        for b in &evicted {
            debug!(
                "{}: override drops teacher {} from {} on {} period {}",
                self.class_section, teacher_id, b.class_id, day, period
            );
            self.overrides.push(OverrideAck {
                teacher_id: teacher_id.to_string(),
                day: day.to_string(),
                period,
                class_section: b.class_section(),
            });
        }
    }

    fn discard_pending(&mut self) {
        if let CellState::ConflictDetected(p) = &self.cell {
            debug!(
                "{}: discarding undecided conflict for teacher {} on {} period {}",
                self.class_section, p.conflict.teacher_id, p.conflict.day, p.conflict.period
            );
            self.cell = CellState::Cancelled;
        }
    }

    fn is_acknowledged(&self, teacher_id: &str, booking: &Booking) -> bool {
        self.overrides.iter().any(|o| {
            o.teacher_id == teacher_id
                && booking.at(&o.day, o.period)
                && booking.belongs_to(&o.class_section)
        })
    }

    fn check_cell(&self, day: &str, period: u32) -> Result<(), EngineError> {
        if !self.settings.is_working_day(day) {
            return Err(EngineError::InvalidTarget(format!(
                "{} is not a working day",
                day
            )));
        }
        if !self.settings.has_period(period) {
            return Err(self.period_out_of_range(period));
        }
        Ok(())
    }

    fn period_out_of_range(&self, period: u32) -> EngineError {
        EngineError::InvalidTarget(format!(
            "period {} is outside 1..={}",
            period, self.settings.total_periods
        ))
    }
}
