//! Attendance records gated by a per-session uniqueness constraint.

use crate::schedule::SessionKey;
use crate::{Store, StoreError};
use chrono::{DateTime, Local, NaiveDate};
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "PRESENT",
            AttendanceStatus::Absent => "ABSENT",
            AttendanceStatus::Late => "LATE",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "PRESENT" => Ok(AttendanceStatus::Present),
            "ABSENT" => Ok(AttendanceStatus::Absent),
            "LATE" => Ok(AttendanceStatus::Late),
            _ => Err(StoreError::Malformed {
                column: "status",
                value: value.to_string(),
            }),
        }
    }
}

/// What a mark attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new attendance row was written.
    Recorded,
    /// The student was already recorded for this session scope.
    AlreadyRecorded,
}

/// One line of the daily report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub roll_number: String,
    pub student_name: String,
    pub group_name: String,
    pub course_name: Option<String>,
    pub recorded_at: DateTime<Local>,
    pub status: AttendanceStatus,
}

fn parse_recorded_at(value: &str) -> Result<DateTime<Local>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|_| StoreError::Malformed {
            column: "recorded_at",
            value: value.to_string(),
        })
}

impl Store {
    /// Records a student as present exactly once per session scope.
    ///
    /// The uniqueness constraint is the idempotence authority: the
    /// insert either lands (`Recorded`) or collides with the existing
    /// row (`AlreadyRecorded`). There is no check-then-insert window,
    /// so concurrent callers cannot double-record.
    pub fn mark_present(
        &self,
        student_id: i64,
        key: &SessionKey,
        at: DateTime<Local>,
    ) -> Result<MarkOutcome, StoreError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO attendance (student_id, group_id, course_id, day, recorded_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                student_id,
                key.group_id,
                key.course_column(),
                key.day_column(),
                at.to_rfc3339(),
                AttendanceStatus::Present.as_str(),
            ],
        )?;
        Ok(if changed == 1 {
            MarkOutcome::Recorded
        } else {
            MarkOutcome::AlreadyRecorded
        })
    }

    /// Whether the student already has a row for this session scope.
    pub fn has_attendance(&self, student_id: i64, key: &SessionKey) -> Result<bool, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT 1 FROM attendance
                 WHERE student_id = ?1 AND group_id = ?2 AND course_id = ?3 AND day = ?4",
                params![
                    student_id,
                    key.group_id,
                    key.course_column(),
                    key.day_column()
                ],
                |_| Ok(()),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Attendance rows recorded on a calendar day.
    pub fn attendance_count(&self, day: NaiveDate) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE day = ?1",
            params![day.format("%Y-%m-%d").to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// The day's attendance joined with student, group and course
    /// names, ordered by recording time.
    pub fn daily_report(&self, day: NaiveDate) -> Result<Vec<ReportRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.roll_number, s.name, g.name, c.name, a.recorded_at, a.status
             FROM attendance a
             JOIN students s ON s.id = a.student_id
             JOIN groups g ON g.id = a.group_id
             LEFT JOIN courses c ON c.id = a.course_id
             WHERE a.day = ?1
             ORDER BY a.recorded_at, a.id",
        )?;
        let rows = stmt.query_map(params![day.format("%Y-%m-%d").to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut report = Vec::new();
        for row in rows {
            let (roll_number, student_name, group_name, course_name, recorded_at, status) = row?;
            report.push(ReportRow {
                roll_number,
                student_name,
                group_name,
                course_name,
                recorded_at: parse_recorded_at(&recorded_at)?,
                status: AttendanceStatus::parse(&status)?,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Fixture {
        store: Store,
        group: i64,
        student: i64,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let group = store.add_group("10-A").unwrap();
        let student = store.add_student("R-42", "Ada Lovelace", group).unwrap();
        Fixture {
            store,
            group,
            student,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, h, min, 0).unwrap()
    }

    #[test]
    fn test_mark_present_is_idempotent_per_scope() {
        let f = fixture();
        let key = SessionKey {
            group_id: f.group,
            course_id: None,
            day: day(2024, 6, 1),
        };

        assert_eq!(
            f.store.mark_present(f.student, &key, at(9, 0)).unwrap(),
            MarkOutcome::Recorded
        );
        assert_eq!(
            f.store.mark_present(f.student, &key, at(9, 5)).unwrap(),
            MarkOutcome::AlreadyRecorded
        );
        assert_eq!(f.store.attendance_count(day(2024, 6, 1)).unwrap(), 1);
        assert!(f.store.has_attendance(f.student, &key).unwrap());
    }

    #[test]
    fn test_distinct_courses_are_distinct_scopes() {
        let f = fixture();
        let course = f.store.add_course("Mathematics").unwrap();
        let no_course = SessionKey {
            group_id: f.group,
            course_id: None,
            day: day(2024, 6, 1),
        };
        let with_course = SessionKey {
            group_id: f.group,
            course_id: Some(course),
            day: day(2024, 6, 1),
        };

        assert_eq!(
            f.store.mark_present(f.student, &no_course, at(9, 0)).unwrap(),
            MarkOutcome::Recorded
        );
        assert_eq!(
            f.store
                .mark_present(f.student, &with_course, at(10, 0))
                .unwrap(),
            MarkOutcome::Recorded
        );
        assert_eq!(f.store.attendance_count(day(2024, 6, 1)).unwrap(), 2);
    }

    #[test]
    fn test_new_day_records_again() {
        let f = fixture();
        let monday = SessionKey {
            group_id: f.group,
            course_id: None,
            day: day(2024, 6, 3),
        };
        let tuesday = SessionKey {
            group_id: f.group,
            course_id: None,
            day: day(2024, 6, 4),
        };

        assert_eq!(
            f.store.mark_present(f.student, &monday, at(9, 0)).unwrap(),
            MarkOutcome::Recorded
        );
        assert_eq!(
            f.store.mark_present(f.student, &tuesday, at(9, 0)).unwrap(),
            MarkOutcome::Recorded
        );
    }

    #[test]
    fn test_mark_unknown_student_fails() {
        let f = fixture();
        let key = SessionKey {
            group_id: f.group,
            course_id: None,
            day: day(2024, 6, 1),
        };
        assert!(f.store.mark_present(999, &key, at(9, 0)).is_err());
    }

    #[test]
    fn test_daily_report_joins_and_orders() {
        let f = fixture();
        let course = f.store.add_course("Mathematics").unwrap();
        let second = f.store.add_student("R-07", "Grace Hopper", f.group).unwrap();

        let with_course = SessionKey {
            group_id: f.group,
            course_id: Some(course),
            day: day(2024, 6, 1),
        };
        let no_course = SessionKey {
            group_id: f.group,
            course_id: None,
            day: day(2024, 6, 1),
        };

        f.store.mark_present(second, &no_course, at(8, 55)).unwrap();
        f.store
            .mark_present(f.student, &with_course, at(9, 10))
            .unwrap();

        let report = f.store.daily_report(day(2024, 6, 1)).unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].roll_number, "R-07");
        assert_eq!(report[0].course_name, None);
        assert_eq!(report[0].status, AttendanceStatus::Present);
        assert_eq!(report[1].roll_number, "R-42");
        assert_eq!(report[1].course_name.as_deref(), Some("Mathematics"));
        assert_eq!(report[1].recorded_at, at(9, 10));

        assert!(f.store.daily_report(day(2024, 6, 2)).unwrap().is_empty());
    }

    #[test]
    fn test_remove_student_cascades_attendance() {
        let f = fixture();
        let key = SessionKey {
            group_id: f.group,
            course_id: None,
            day: day(2024, 6, 1),
        };
        f.store.mark_present(f.student, &key, at(9, 0)).unwrap();
        assert_eq!(f.store.attendance_count(day(2024, 6, 1)).unwrap(), 1);

        f.store.remove_student("R-42").unwrap();
        assert_eq!(f.store.attendance_count(day(2024, 6, 1)).unwrap(), 0);
    }
}
