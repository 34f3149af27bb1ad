//! Load/save contracts the allocation engine consumes, plus the SQLite
//! workspace implementation behind the sidecar.

use crate::availability::{self, BookingsByTeacher};
use crate::db;
use crate::model::{Booking, ClassSection, Grid, Mapping, TimetableSettings};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;

pub const TIMETABLE_SETTINGS_KEY: &str = "setup.timetable";

pub trait SettingsProvider {
    /// `None` until the school has configured its week.
    fn timetable_settings(&self) -> anyhow::Result<Option<TimetableSettings>>;
}

pub trait MappingCatalog {
    fn class_section_exists(&self, class_section: &ClassSection) -> anyhow::Result<bool>;
    fn mappings(&self, class_section: &ClassSection) -> anyhow::Result<Vec<Mapping>>;
    /// Every teacher the catalog knows about.
    fn teacher_ids(&self) -> anyhow::Result<Vec<String>>;
}

pub trait GridStore {
    fn grid(&self, class_section: &ClassSection) -> anyhow::Result<Option<Grid>>;

    /// Revision of the stored grid, `None` when nothing is stored yet.
    fn grid_revision(&self, class_section: &ClassSection) -> anyhow::Result<Option<String>> {
        Ok(self.grid(class_section)?.map(|g| g.revision()))
    }

    fn save_grid(&self, class_section: &ClassSection, grid: &Grid) -> anyhow::Result<()>;
}

pub trait AvailabilityStore {
    fn teacher_bookings(&self, teacher_id: &str) -> anyhow::Result<Vec<Booking>>;

    fn load_all(&self, teacher_ids: &[String]) -> anyhow::Result<HashMap<String, Vec<Booking>>> {
        let mut out = HashMap::with_capacity(teacher_ids.len());
        for teacher_id in teacher_ids {
            out.insert(teacher_id.clone(), self.teacher_bookings(teacher_id)?);
        }
        Ok(out)
    }

    /// Teachers whose documents hold at least one booking for `class_section`.
    fn teachers_booked_for(&self, class_section: &ClassSection) -> anyhow::Result<Vec<String>>;

    /// For each teacher in `bookings`, replaces that teacher's bookings for
    /// `class_section` and leaves the rest of the document alone.
    fn replace_for_class_section(
        &self,
        class_section: &ClassSection,
        bookings: &BookingsByTeacher,
    ) -> anyhow::Result<()>;
}

pub trait TimetableStore: SettingsProvider + MappingCatalog + GridStore + AvailabilityStore {}

impl<T> TimetableStore for T where T: SettingsProvider + MappingCatalog + GridStore + AvailabilityStore {}

pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn subject_names(&self) -> anyhow::Result<HashMap<String, String>> {
        self.names("SELECT id, name FROM subjects")
    }

    pub fn teacher_names(&self) -> anyhow::Result<HashMap<String, String>> {
        self.names("SELECT id, name FROM teachers")
    }

    fn names(&self, sql: &str) -> anyhow::Result<HashMap<String, String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    fn write_bookings(&self, teacher_id: &str, bookings: &[Booking]) -> anyhow::Result<()> {
        let json = serde_json::to_string(bookings)?;
        self.conn
            .execute(
                "INSERT INTO teacher_availability(teacher_id, bookings_json, updated_at)
                 VALUES(?, ?, ?)
                 ON CONFLICT(teacher_id) DO UPDATE SET
                   bookings_json = excluded.bookings_json,
                   updated_at = excluded.updated_at",
                (teacher_id, json, chrono::Utc::now().to_rfc3339()),
            )
            .with_context(|| format!("failed to write availability for teacher {}", teacher_id))?;
        Ok(())
    }
}

impl SettingsProvider for SqliteStore<'_> {
    fn timetable_settings(&self) -> anyhow::Result<Option<TimetableSettings>> {
        let Some(raw) = db::settings_get_json(self.conn, TIMETABLE_SETTINGS_KEY)? else {
            return Ok(None);
        };
        let settings = serde_json::from_value(raw).context("stored timetable settings are malformed")?;
        Ok(Some(settings))
    }
}

impl MappingCatalog for SqliteStore<'_> {
    fn class_section_exists(&self, class_section: &ClassSection) -> anyhow::Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sections WHERE class_id = ? AND id = ?",
                (&class_section.class_id, &class_section.section_id),
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn mappings(&self, class_section: &ClassSection) -> anyhow::Result<Vec<Mapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT class_id, section_id, subject_id, teacher_id, periods_per_week
             FROM subject_teacher_mappings
             WHERE class_id = ? AND section_id = ?
             ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map(
                (&class_section.class_id, &class_section.section_id),
                |r| {
                    Ok(Mapping {
                        class_id: r.get(0)?,
                        section_id: r.get(1)?,
                        subject_id: r.get(2)?,
                        teacher_id: r.get(3)?,
                        periods_per_week: r.get(4)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn teacher_ids(&self) -> anyhow::Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT id FROM teachers ORDER BY id")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

impl GridStore for SqliteStore<'_> {
    fn grid(&self, class_section: &ClassSection) -> anyhow::Result<Option<Grid>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT grid_json FROM class_timetables WHERE class_id = ? AND section_id = ?",
                (&class_section.class_id, &class_section.section_id),
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => {
                let grid = serde_json::from_str(&s)
                    .with_context(|| format!("stored grid {} is malformed", class_section.key()))?;
                Ok(Some(grid))
            }
            None => Ok(None),
        }
    }

    fn grid_revision(&self, class_section: &ClassSection) -> anyhow::Result<Option<String>> {
        let revision = self
            .conn
            .query_row(
                "SELECT revision FROM class_timetables WHERE class_id = ? AND section_id = ?",
                (&class_section.class_id, &class_section.section_id),
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(revision)
    }

    fn save_grid(&self, class_section: &ClassSection, grid: &Grid) -> anyhow::Result<()> {
        let json = serde_json::to_string(grid)?;
        self.conn
            .execute(
                "INSERT INTO class_timetables(class_id, section_id, grid_json, revision, updated_at)
                 VALUES(?, ?, ?, ?, ?)
                 ON CONFLICT(class_id, section_id) DO UPDATE SET
                   grid_json = excluded.grid_json,
                   revision = excluded.revision,
                   updated_at = excluded.updated_at",
                (
                    &class_section.class_id,
                    &class_section.section_id,
                    json,
                    grid.revision(),
                    chrono::Utc::now().to_rfc3339(),
                ),
            )
            .with_context(|| format!("failed to write grid {}", class_section.key()))?;
        Ok(())
    }
}

impl AvailabilityStore for SqliteStore<'_> {
    fn teacher_bookings(&self, teacher_id: &str) -> anyhow::Result<Vec<Booking>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT bookings_json FROM teacher_availability WHERE teacher_id = ?",
                [teacher_id],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => serde_json::from_str(&s)
                .with_context(|| format!("availability of teacher {} is malformed", teacher_id)),
            None => Ok(Vec::new()),
        }
    }

    fn teachers_booked_for(&self, class_section: &ClassSection) -> anyhow::Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT teacher_id, bookings_json FROM teacher_availability ORDER BY teacher_id")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        for (teacher_id, json) in rows {
            let bookings: Vec<Booking> = serde_json::from_str(&json)
                .with_context(|| format!("availability of teacher {} is malformed", teacher_id))?;
            if bookings.iter().any(|b| b.belongs_to(class_section)) {
                out.push(teacher_id);
            }
        }
        Ok(out)
    }

    fn replace_for_class_section(
        &self,
        class_section: &ClassSection,
        bookings: &BookingsByTeacher,
    ) -> anyhow::Result<()> {
        for (teacher_id, replacement) in bookings {
            let existing = self.teacher_bookings(teacher_id)?;
            let merged = availability::merge_for_class_section(existing, class_section, replacement);
            self.write_bookings(teacher_id, &merged)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory store for engine tests. Shares state through `Rc` so two
    //! sessions can race against one "database".

    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    pub struct MemoryState {
        pub settings: Option<TimetableSettings>,
        pub sections: Vec<ClassSection>,
        pub mappings: Vec<Mapping>,
        pub teachers: Vec<String>,
        pub grids: HashMap<ClassSection, Grid>,
        pub availability: HashMap<String, Vec<Booking>>,
        pub grid_writes: usize,
        /// Makes every availability write fail, as a full disk would.
        pub fail_availability_writes: bool,
    }

    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        pub state: Rc<RefCell<MemoryState>>,
    }

    impl SettingsProvider for MemoryStore {
        fn timetable_settings(&self) -> anyhow::Result<Option<TimetableSettings>> {
            Ok(self.state.borrow().settings.clone())
        }
    }

    impl MappingCatalog for MemoryStore {
        fn class_section_exists(&self, class_section: &ClassSection) -> anyhow::Result<bool> {
            Ok(self.state.borrow().sections.contains(class_section))
        }

        fn mappings(&self, class_section: &ClassSection) -> anyhow::Result<Vec<Mapping>> {
            Ok(self
                .state
                .borrow()
                .mappings
                .iter()
                .filter(|m| m.class_section() == *class_section)
                .cloned()
                .collect())
        }

        fn teacher_ids(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.state.borrow().teachers.clone())
        }
    }

    impl GridStore for MemoryStore {
        fn grid(&self, class_section: &ClassSection) -> anyhow::Result<Option<Grid>> {
            Ok(self.state.borrow().grids.get(class_section).cloned())
        }

        fn save_grid(&self, class_section: &ClassSection, grid: &Grid) -> anyhow::Result<()> {
            let mut state = self.state.borrow_mut();
            state.grids.insert(class_section.clone(), grid.clone());
            state.grid_writes += 1;
            Ok(())
        }
    }

    impl AvailabilityStore for MemoryStore {
        fn teacher_bookings(&self, teacher_id: &str) -> anyhow::Result<Vec<Booking>> {
            Ok(self
                .state
                .borrow()
                .availability
                .get(teacher_id)
                .cloned()
                .unwrap_or_default())
        }

        fn teachers_booked_for(&self, class_section: &ClassSection) -> anyhow::Result<Vec<String>> {
            let state = self.state.borrow();
            let mut out: Vec<String> = state
                .availability
                .iter()
                .filter(|(_, b)| b.iter().any(|b| b.belongs_to(class_section)))
                .map(|(t, _)| t.clone())
                .collect();
            out.sort();
            Ok(out)
        }

        fn replace_for_class_section(
            &self,
            class_section: &ClassSection,
            bookings: &BookingsByTeacher,
        ) -> anyhow::Result<()> {
            let mut state = self.state.borrow_mut();
            if state.fail_availability_writes {
                anyhow::bail!("availability write failed for {}", class_section);
            }
            for (teacher_id, replacement) in bookings {
                let existing = state.availability.remove(teacher_id).unwrap_or_default();
                let merged =
                    availability::merge_for_class_section(existing, class_section, replacement);
                state.availability.insert(teacher_id.clone(), merged);
            }
            Ok(())
        }
    }
}
