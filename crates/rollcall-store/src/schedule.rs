//! Timetable and session-window resolution.

use crate::{Store, StoreError};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, OptionalExtension};

const TIME_FORMAT: &str = "%H:%M";

/// Scope a single attendance record belongs to: one group, one
/// optional course, one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub group_id: i64,
    pub course_id: Option<i64>,
    pub day: NaiveDate,
}

impl SessionKey {
    /// Column value standing in for "no course"; real course ids start
    /// at 1.
    pub(crate) fn course_column(&self) -> i64 {
        self.course_id.unwrap_or(0)
    }

    pub(crate) fn day_column(&self) -> String {
        self.day.format("%Y-%m-%d").to_string()
    }
}

/// One recurring timetable entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TimetableSlot {
    pub id: i64,
    pub teacher_id: i64,
    pub group_id: i64,
    pub course_id: Option<i64>,
    /// 0 = Monday … 6 = Sunday.
    pub day_of_week: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub teacher_name: String,
    pub group_name: String,
    pub course_name: Option<String>,
}

/// The slot currently in session for a teacher.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub slot_id: i64,
    pub group_id: i64,
    pub course_id: Option<i64>,
    pub group_name: String,
    pub course_name: Option<String>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActiveSession {
    /// Attendance scope for this session on the given calendar day.
    pub fn session_key(&self, day: NaiveDate) -> SessionKey {
        SessionKey {
            group_id: self.group_id,
            course_id: self.course_id,
            day,
        }
    }
}

fn parse_time(column: &'static str, value: &str) -> Result<NaiveTime, StoreError> {
    NaiveTime::parse_from_str(value, TIME_FORMAT).map_err(|_| StoreError::Malformed {
        column,
        value: value.to_string(),
    })
}

impl Store {
    /// Adds a recurring timetable slot. `day_of_week` is 0 = Monday.
    pub fn add_timetable_slot(
        &self,
        teacher_id: i64,
        group_id: i64,
        course_id: Option<i64>,
        day_of_week: u8,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<i64, StoreError> {
        if start >= end {
            return Err(StoreError::InvalidSlot {
                start: start.format(TIME_FORMAT).to_string(),
                end: end.format(TIME_FORMAT).to_string(),
            });
        }
        if day_of_week > 6 {
            return Err(StoreError::Malformed {
                column: "day_of_week",
                value: day_of_week.to_string(),
            });
        }
        self.conn.execute(
            "INSERT INTO timetable (teacher_id, group_id, course_id, day_of_week, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                teacher_id,
                group_id,
                course_id,
                day_of_week,
                start.format(TIME_FORMAT).to_string(),
                end.format(TIME_FORMAT).to_string(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn timetable(&self) -> Result<Vec<TimetableSlot>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.teacher_id, t.group_id, t.course_id, t.day_of_week,
                    t.start_time, t.end_time, te.name, g.name, c.name
             FROM timetable t
             JOIN teachers te ON te.id = t.teacher_id
             JOIN groups g ON g.id = t.group_id
             LEFT JOIN courses c ON c.id = t.course_id
             ORDER BY t.day_of_week, t.start_time, t.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, u8>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let mut slots = Vec::new();
        for row in rows {
            let (id, teacher_id, group_id, course_id, day_of_week, start, end, teacher_name, group_name, course_name) =
                row?;
            slots.push(TimetableSlot {
                id,
                teacher_id,
                group_id,
                course_id,
                day_of_week,
                start: parse_time("start_time", &start)?,
                end: parse_time("end_time", &end)?,
                teacher_name,
                group_name,
                course_name,
            });
        }
        Ok(slots)
    }

    /// Resolves the session window covering `at` for this teacher.
    ///
    /// A slot matches when its weekday equals `at`'s (0 = Monday) and
    /// its `[start, end)` range contains the time of day at minute
    /// resolution. With overlapping slots the earliest start wins,
    /// then the lowest id, so the answer is deterministic.
    pub fn active_session(
        &self,
        teacher_id: i64,
        at: NaiveDateTime,
    ) -> Result<Option<ActiveSession>, StoreError> {
        let weekday = at.weekday().num_days_from_monday();
        let time_of_day = at.time().format(TIME_FORMAT).to_string();

        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.group_id, t.course_id, t.start_time, t.end_time, g.name, c.name
             FROM timetable t
             JOIN groups g ON g.id = t.group_id
             LEFT JOIN courses c ON c.id = t.course_id
             WHERE t.teacher_id = ?1 AND t.day_of_week = ?2
               AND t.start_time <= ?3 AND ?3 < t.end_time
             ORDER BY t.start_time, t.id
             LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![teacher_id, weekday, time_of_day], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .optional()?;

        let Some((slot_id, group_id, course_id, start, end, group_name, course_name)) = row else {
            return Ok(None);
        };
        Ok(Some(ActiveSession {
            slot_id,
            group_id,
            course_id,
            group_name,
            course_name,
            start: parse_time("start_time", &start)?,
            end: parse_time("end_time", &end)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // 2024-06-03 is a Monday.
    fn monday_at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    struct Fixture {
        store: Store,
        teacher: i64,
        group: i64,
        course: i64,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let teacher = store.add_teacher("Ms. Hopper").unwrap();
        let group = store.add_group("10-A").unwrap();
        let course = store.add_course("Mathematics").unwrap();
        Fixture {
            store,
            teacher,
            group,
            course,
        }
    }

    #[test]
    fn test_active_session_inside_window() {
        let f = fixture();
        f.store
            .add_timetable_slot(f.teacher, f.group, Some(f.course), 0, time(9, 0), time(10, 0))
            .unwrap();

        let session = f
            .store
            .active_session(f.teacher, monday_at(9, 30))
            .unwrap()
            .unwrap();
        assert_eq!(session.group_id, f.group);
        assert_eq!(session.course_id, Some(f.course));
        assert_eq!(session.group_name, "10-A");
        assert_eq!(session.course_name.as_deref(), Some("Mathematics"));
    }

    #[test]
    fn test_session_window_is_half_open() {
        let f = fixture();
        f.store
            .add_timetable_slot(f.teacher, f.group, Some(f.course), 0, time(9, 0), time(10, 0))
            .unwrap();

        // Start is included, end is excluded.
        assert!(f
            .store
            .active_session(f.teacher, monday_at(9, 0))
            .unwrap()
            .is_some());
        assert!(f
            .store
            .active_session(f.teacher, monday_at(10, 0))
            .unwrap()
            .is_none());
        assert!(f
            .store
            .active_session(f.teacher, monday_at(9, 59))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_no_session_on_other_weekday_or_teacher() {
        let f = fixture();
        f.store
            .add_timetable_slot(f.teacher, f.group, Some(f.course), 0, time(9, 0), time(10, 0))
            .unwrap();

        // 2024-06-04 is a Tuesday.
        let tuesday = NaiveDate::from_ymd_opt(2024, 6, 4)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert!(f.store.active_session(f.teacher, tuesday).unwrap().is_none());

        let other_teacher = f.store.add_teacher("Mr. Turing").unwrap();
        assert!(f
            .store
            .active_session(other_teacher, monday_at(9, 30))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_overlapping_slots_resolve_deterministically() {
        let f = fixture();
        let early = f
            .store
            .add_timetable_slot(f.teacher, f.group, Some(f.course), 0, time(9, 0), time(11, 0))
            .unwrap();
        f.store
            .add_timetable_slot(f.teacher, f.group, None, 0, time(10, 0), time(12, 0))
            .unwrap();

        // Both cover 10:30; the earlier start wins.
        let session = f
            .store
            .active_session(f.teacher, monday_at(10, 30))
            .unwrap()
            .unwrap();
        assert_eq!(session.slot_id, early);
    }

    #[test]
    fn test_identical_windows_pick_lowest_id() {
        let f = fixture();
        let first = f
            .store
            .add_timetable_slot(f.teacher, f.group, None, 0, time(9, 0), time(10, 0))
            .unwrap();
        f.store
            .add_timetable_slot(f.teacher, f.group, Some(f.course), 0, time(9, 0), time(10, 0))
            .unwrap();

        let session = f
            .store
            .active_session(f.teacher, monday_at(9, 15))
            .unwrap()
            .unwrap();
        assert_eq!(session.slot_id, first);
    }

    #[test]
    fn test_zero_length_slot_rejected() {
        let f = fixture();
        assert!(matches!(
            f.store
                .add_timetable_slot(f.teacher, f.group, None, 0, time(9, 0), time(9, 0)),
            Err(StoreError::InvalidSlot { .. })
        ));
    }

    #[test]
    fn test_invalid_weekday_rejected() {
        let f = fixture();
        assert!(matches!(
            f.store
                .add_timetable_slot(f.teacher, f.group, None, 7, time(9, 0), time(10, 0)),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn test_timetable_listing_round_trips() {
        let f = fixture();
        f.store
            .add_timetable_slot(f.teacher, f.group, Some(f.course), 2, time(13, 0), time(14, 30))
            .unwrap();

        let slots = f.store.timetable().unwrap();
        assert_eq!(slots.len(), 1);
        let slot = &slots[0];
        assert_eq!(slot.day_of_week, 2);
        assert_eq!(slot.start, time(13, 0));
        assert_eq!(slot.end, time(14, 30));
        assert_eq!(slot.teacher_name, "Ms. Hopper");
        assert_eq!(slot.group_name, "10-A");
        assert_eq!(slot.course_name.as_deref(), Some("Mathematics"));
    }

    #[test]
    fn test_session_key_course_sentinel() {
        let session = ActiveSession {
            slot_id: 1,
            group_id: 5,
            course_id: None,
            group_name: "10-A".into(),
            course_name: None,
            start: time(9, 0),
            end: time(10, 0),
        };
        let key = session.session_key(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(key.course_column(), 0);
        assert_eq!(key.day_column(), "2024-06-01");
    }
}
