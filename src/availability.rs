use crate::model::{Booking, ClassSection, Grid, TimetableSettings};
use std::collections::{BTreeMap, HashMap};

/// Bookings grouped by teacher id, ordered so writes touch teachers in a
/// stable order.
pub type BookingsByTeacher = BTreeMap<String, Vec<Booking>>;

/// In-memory shadow of the teacher availability documents.
///
/// Seeded once when a session opens and mutated as the session assigns,
/// overrides and removes entries. It is never written back directly; the
/// authoritative documents only change through a successful save.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityIndex {
    by_teacher: HashMap<String, Vec<Booking>>,
}

impl AvailabilityIndex {
    pub fn new(by_teacher: HashMap<String, Vec<Booking>>) -> Self {
        Self { by_teacher }
    }

    pub fn bookings(&self, teacher_id: &str) -> &[Booking] {
        self.by_teacher
            .get(teacher_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First booking that would double-book `teacher_id` at `(day, period)`
    /// outside `own`.
    pub fn find_conflict(
        &self,
        teacher_id: &str,
        day: &str,
        period: u32,
        own: &ClassSection,
    ) -> Option<&Booking> {
        self.bookings(teacher_id)
            .iter()
            .find(|b| b.at(day, period) && !b.belongs_to(own))
    }

    pub fn add(&mut self, teacher_id: &str, booking: Booking) {
        self.by_teacher
            .entry(teacher_id.to_string())
            .or_default()
            .push(booking);
    }

    /// Drops one booking matching the removed entry. Returns false when the
    /// shadow held no such booking.
    pub fn remove_one(
        &mut self,
        teacher_id: &str,
        day: &str,
        period: u32,
        own: &ClassSection,
        subject_id: &str,
    ) -> bool {
        let Some(bookings) = self.by_teacher.get_mut(teacher_id) else {
            return false;
        };
        let pos = bookings
            .iter()
            .position(|b| b.at(day, period) && b.belongs_to(own) && b.subject_id == subject_id);
        match pos {
            Some(i) => {
                bookings.remove(i);
                true
            }
            None => false,
        }
    }

    /// Removes every booking of `teacher_id` at `(day, period)` that belongs to
    /// another class-section and returns them.
    pub fn evict_conflicts(
        &mut self,
        teacher_id: &str,
        day: &str,
        period: u32,
        own: &ClassSection,
    ) -> Vec<Booking> {
        let Some(bookings) = self.by_teacher.get_mut(teacher_id) else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        bookings.retain(|b| {
            if b.at(day, period) && !b.belongs_to(own) {
                evicted.push(b.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn set_teacher(&mut self, teacher_id: &str, bookings: Vec<Booking>) {
        self.by_teacher.insert(teacher_id.to_string(), bookings);
    }
}

/// Every booking a grid implies, grouped by teacher.
pub fn bookings_from_grid(class_section: &ClassSection, grid: &Grid) -> BookingsByTeacher {
    let mut out = BookingsByTeacher::new();
    for (day, period, entry) in grid.entries() {
        out.entry(entry.teacher_id.clone()).or_default().push(Booking {
            day: day.to_string(),
            period,
            class_id: class_section.class_id.clone(),
            section_id: class_section.section_id.clone(),
            subject_id: entry.subject_id.clone(),
        });
    }
    out
}

/// Replaces a teacher's bookings for one class-section, leaving bookings
/// for every other class-section as they were.
pub fn merge_for_class_section(
    existing: Vec<Booking>,
    class_section: &ClassSection,
    replacement: &[Booking],
) -> Vec<Booking> {
    let mut merged: Vec<Booking> = existing
        .into_iter()
        .filter(|b| !b.belongs_to(class_section))
        .collect();
    merged.extend(replacement.iter().cloned());
    merged
}

/// Sorts by working-day order, then period. Days outside the working week
/// sort last by code.
pub fn sort_bookings(bookings: &mut [Booking], settings: &TimetableSettings) {
    bookings.sort_by(|a, b| {
        let da = settings.day_order(&a.day).unwrap_or(usize::MAX);
        let db = settings.day_order(&b.day).unwrap_or(usize::MAX);
        da.cmp(&db)
            .then_with(|| a.day.cmp(&b.day))
            .then_with(|| a.period.cmp(&b.period))
            .then_with(|| a.class_id.cmp(&b.class_id))
            .then_with(|| a.section_id.cmp(&b.section_id))
    });
}

/// Working `(day, period)` cells where the teacher has no booking.
pub fn free_slots(bookings: &[Booking], settings: &TimetableSettings) -> Vec<(String, u32)> {
    let mut out = Vec::new();
    for day in &settings.working_days {
        for period in 1..=settings.total_periods {
            if !bookings.iter().any(|b| b.at(day, period)) {
                out.push((day.clone(), period));
            }
        }
    }
    out
}
