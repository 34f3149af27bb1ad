use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

pub const MAX_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teacher {
    pub id: String,
    pub name: String,
}

/// Identifies one weekly grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSection {
    pub class_id: String,
    pub section_id: String,
}

impl ClassSection {
    pub fn new(class_id: impl Into<String>, section_id: impl Into<String>) -> Self {
        Self {
            class_id: class_id.into(),
            section_id: section_id.into(),
        }
    }

    /// Document key used by the grid store: `classId_sectionId`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.class_id, self.section_id)
    }
}

impl fmt::Display for ClassSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.class_id, self.section_id)
    }
}

/// A (subject, teacher) pair available to one class-section, capped at
/// `periods_per_week` entries across the whole grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub class_id: String,
    pub section_id: String,
    pub subject_id: String,
    pub teacher_id: String,
    pub periods_per_week: u32,
}

impl Mapping {
    #[cfg(test)]
    pub fn class_section(&self) -> ClassSection {
        ClassSection::new(self.class_id.clone(), self.section_id.clone())
    }

    pub fn is_for(&self, subject_id: &str, teacher_id: &str) -> bool {
        self.subject_id == subject_id && self.teacher_id == teacher_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub subject_id: String,
    pub teacher_id: String,
}

impl Entry {
    pub fn new(subject_id: impl Into<String>, teacher_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            teacher_id: teacher_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub period: u32,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Slot {
    pub fn new(period: u32) -> Self {
        Self {
            period,
            entries: Vec::new(),
        }
    }

    pub fn has_teacher(&self, teacher_id: &str) -> bool {
        self.entries.iter().any(|e| e.teacher_id == teacher_id)
    }
}

/// Weekly grid for one class-section: day code -> slots ordered by period.
///
/// Serialized as a plain JSON object so the persisted document reads
/// `{"MON": [{"period": 1, "entries": [...]}], ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grid {
    days: BTreeMap<String, Vec<Slot>>,
}

impl Grid {
    #[cfg(test)]
    pub fn with_days(days: &[String]) -> Self {
        let mut grid = Self::default();
        grid.ensure_days(days);
        grid
    }

    /// Adds an empty slot list for every working day the grid does not know yet.
    pub fn ensure_days(&mut self, days: &[String]) {
        for day in days {
            self.days.entry(day.clone()).or_default();
        }
    }

    /// Orders every day's slots by period. Stored documents may come from
    /// writers that did not keep them sorted.
    pub fn sort_slots(&mut self) {
        for slots in self.days.values_mut() {
            slots.sort_by_key(|s| s.period);
        }
    }

    pub fn day(&self, day: &str) -> &[Slot] {
        self.days.get(day).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn days(&self) -> impl Iterator<Item = (&String, &Vec<Slot>)> {
        self.days.iter()
    }

    pub fn slot(&self, day: &str, period: u32) -> Option<&Slot> {
        self.days.get(day)?.iter().find(|s| s.period == period)
    }

    pub fn slot_mut(&mut self, day: &str, period: u32) -> Option<&mut Slot> {
        self.days.get_mut(day)?.iter_mut().find(|s| s.period == period)
    }

    /// Returns the slot for `(day, period)`, inserting an empty one at its
    /// sorted position if needed.
    pub fn slot_or_insert(&mut self, day: &str, period: u32) -> &mut Slot {
        let slots = self.days.entry(day.to_string()).or_default();
        let idx = match slots.binary_search_by_key(&period, |s| s.period) {
            Ok(i) => i,
            Err(i) => {
                slots.insert(i, Slot::new(period));
                i
            }
        };
        &mut slots[idx]
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, u32, &Entry)> {
        self.days.iter().flat_map(|(day, slots)| {
            slots.iter().flat_map(move |slot| {
                slot.entries
                    .iter()
                    .map(move |entry| (day.as_str(), slot.period, entry))
            })
        })
    }

    /// Number of entries for one (subject, teacher) pair across the whole week.
    pub fn count(&self, subject_id: &str, teacher_id: &str) -> usize {
        self.entries()
            .filter(|(_, _, e)| e.subject_id == subject_id && e.teacher_id == teacher_id)
            .count()
    }

    pub fn entry_count(&self) -> usize {
        self.entries().count()
    }

    /// Checks the structural invariants: one slot per period per day and
    /// complete entries.
    pub fn validate(&self) -> Result<(), String> {
        for (day, slots) in &self.days {
            if day.trim().is_empty() {
                return Err("day code must not be empty".to_string());
            }
            let mut seen = std::collections::HashSet::new();
            for slot in slots {
                if !seen.insert(slot.period) {
                    return Err(format!("{} has more than one slot for period {}", day, slot.period));
                }
                for entry in &slot.entries {
                    if entry.subject_id.is_empty() || entry.teacher_id.is_empty() {
                        return Err(format!(
                            "{} period {} holds an entry without subject or teacher",
                            day, slot.period
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Content revision (hex SHA-256) of the grid document.
    pub fn revision(&self) -> String {
        let mut hasher = Sha256::new();
        for (day, slots) in &self.days {
            hasher.update(day.as_bytes());
            hasher.update([0u8]);
            for slot in slots {
                hasher.update(slot.period.to_le_bytes());
                for entry in &slot.entries {
                    hasher.update(entry.subject_id.as_bytes());
                    hasher.update([1u8]);
                    hasher.update(entry.teacher_id.as_bytes());
                    hasher.update([2u8]);
                }
                hasher.update([3u8]);
            }
            hasher.update([4u8]);
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// One occupied cell in a teacher's availability document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub day: String,
    pub period: u32,
    pub class_id: String,
    pub section_id: String,
    pub subject_id: String,
}

impl Booking {
    pub fn at(&self, day: &str, period: u32) -> bool {
        self.day == day && self.period == period
    }

    pub fn belongs_to(&self, class_section: &ClassSection) -> bool {
        self.class_id == class_section.class_id && self.section_id == class_section.section_id
    }

    pub fn class_section(&self) -> ClassSection {
        ClassSection::new(self.class_id.clone(), self.section_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Break {
    pub after_period: u32,
    pub label: String,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableSettings {
    pub working_days: Vec<String>,
    pub total_periods: u32,
    #[serde(default)]
    pub breaks: Vec<Break>,
}

impl TimetableSettings {
    /// Scheduling is only defined once both axes of the grid are bounded.
    pub fn is_bounded(&self) -> bool {
        !self.working_days.is_empty() && self.total_periods > 0
    }

    pub fn is_working_day(&self, day: &str) -> bool {
        self.working_days.iter().any(|d| d == day)
    }

    pub fn has_period(&self, period: u32) -> bool {
        (1..=self.total_periods).contains(&period)
    }

    pub fn day_order(&self, day: &str) -> Option<usize> {
        self.working_days.iter().position(|d| d == day)
    }
}

/// Trims and checks an identifier coming from the catalog or a request.
pub fn validate_id(kind: &str, value: &str) -> Result<String, String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(format!("{} must not be empty", kind));
    }
    if v.len() > MAX_ID_LEN {
        return Err(format!("{} length must be <= {}", kind, MAX_ID_LEN));
    }
    Ok(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn days(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn slot_or_insert_keeps_periods_sorted() {
        let mut grid = Grid::with_days(&days(&["MON"]));
        grid.slot_or_insert("MON", 4);
        grid.slot_or_insert("MON", 1);
        grid.slot_or_insert("MON", 3);
        grid.slot_or_insert("MON", 1);

        let periods: Vec<u32> = grid.day("MON").iter().map(|s| s.period).collect();
        assert_eq!(periods, vec![1, 3, 4]);
    }

    #[test]
    fn count_matches_subject_and_teacher_pair() {
        let mut grid = Grid::with_days(&days(&["MON", "TUE"]));
        grid.slot_or_insert("MON", 1).entries.push(Entry::new("math", "t1"));
        grid.slot_or_insert("TUE", 2).entries.push(Entry::new("math", "t1"));
        grid.slot_or_insert("TUE", 2).entries.push(Entry::new("math", "t2"));
        grid.slot_or_insert("TUE", 3).entries.push(Entry::new("phys", "t1"));

        assert_eq!(grid.count("math", "t1"), 2);
        assert_eq!(grid.count("math", "t2"), 1);
        assert_eq!(grid.count("chem", "t1"), 0);
        assert_eq!(grid.entry_count(), 4);
    }

    #[test]
    fn validate_rejects_duplicate_period_slots() {
        let raw = serde_json::json!({
            "MON": [
                { "period": 1, "entries": [] },
                { "period": 1, "entries": [{ "subjectId": "math", "teacherId": "t1" }] }
            ]
        });
        let grid: Grid = serde_json::from_value(raw).expect("grid json");
        let e = grid.validate().expect_err("duplicate period must fail");
        assert!(e.contains("period 1"));
    }

    #[test]
    fn revision_tracks_content() {
        let mut a = Grid::with_days(&days(&["MON"]));
        let b = Grid::with_days(&days(&["MON"]));
        assert_eq!(a.revision(), b.revision());

        a.slot_or_insert("MON", 2).entries.push(Entry::new("math", "t1"));
        assert_ne!(a.revision(), b.revision());
        assert_eq!(a.revision().len(), 64);
    }

    #[test]
    fn grid_serializes_as_day_object() {
        let mut grid = Grid::with_days(&days(&["MON"]));
        grid.slot_or_insert("MON", 1).entries.push(Entry::new("math", "t1"));
        let v = serde_json::to_value(&grid).expect("serialize");
        assert_eq!(v["MON"][0]["period"], 1);
        assert_eq!(v["MON"][0]["entries"][0]["teacherId"], "t1");
    }

    #[test]
    fn validate_id_trims_and_bounds() {
        assert_eq!(validate_id("classId", "  8A ").as_deref(), Ok("8A"));
        assert!(validate_id("classId", "   ").is_err());
        assert!(validate_id("classId", &"x".repeat(MAX_ID_LEN + 1)).is_err());
    }
}
