//! Roster tables: groups, teachers, courses, students.

use crate::{Store, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct GroupRecord {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeacherRecord {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseRecord {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentRecord {
    pub id: i64,
    pub roll_number: String,
    pub name: String,
    pub group_id: i64,
    pub group_name: String,
    pub embedding_path: Option<PathBuf>,
}

fn row_to_student(row: &Row) -> Result<StudentRecord, rusqlite::Error> {
    Ok(StudentRecord {
        id: row.get("id")?,
        roll_number: row.get("roll_number")?,
        name: row.get("name")?,
        group_id: row.get("group_id")?,
        group_name: row.get("group_name")?,
        embedding_path: row
            .get::<_, Option<String>>("embedding_path")?
            .map(PathBuf::from),
    })
}

const STUDENT_COLUMNS: &str = "s.id AS id, s.roll_number AS roll_number, s.name AS name, \
     s.group_id AS group_id, g.name AS group_name, s.embedding_path AS embedding_path";

impl Store {
    /// Inserts a group, returning the existing id when the name is
    /// already taken.
    pub fn add_group(&self, name: &str) -> Result<i64, StoreError> {
        self.conn
            .execute("INSERT OR IGNORE INTO groups (name) VALUES (?1)", params![name])?;
        let id = self.conn.query_row(
            "SELECT id FROM groups WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn groups(&self) -> Result<Vec<GroupRecord>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM groups ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(GroupRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Inserts a teacher, returning the existing id when the name is
    /// already taken.
    pub fn add_teacher(&self, name: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO teachers (name) VALUES (?1)",
            params![name],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM teachers WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn teachers(&self) -> Result<Vec<TeacherRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM teachers ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(TeacherRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Inserts a course, returning the existing id when the name is
    /// already taken.
    pub fn add_course(&self, name: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO courses (name) VALUES (?1)",
            params![name],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM courses WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn courses(&self) -> Result<Vec<CourseRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM courses ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(CourseRecord {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Adds a student. A roll number that is already registered is a
    /// [`StoreError::DuplicateRoll`].
    pub fn add_student(
        &self,
        roll_number: &str,
        name: &str,
        group_id: i64,
    ) -> Result<i64, StoreError> {
        match self.conn.execute(
            "INSERT INTO students (roll_number, name, group_id) VALUES (?1, ?2, ?3)",
            params![roll_number, name, group_id],
        ) {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(StoreError::DuplicateRoll(roll_number.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn students(&self) -> Result<Vec<StudentRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STUDENT_COLUMNS}
             FROM students s
             JOIN groups g ON g.id = s.group_id
             ORDER BY s.roll_number"
        ))?;
        let rows = stmt.query_map([], |row| row_to_student(row))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn student_by_roll(&self, roll_number: &str) -> Result<Option<StudentRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STUDENT_COLUMNS}
             FROM students s
             JOIN groups g ON g.id = s.group_id
             WHERE s.roll_number = ?1"
        ))?;
        Ok(stmt
            .query_row(params![roll_number], |row| row_to_student(row))
            .optional()?)
    }

    /// Points a student at their stored embedding file.
    pub fn set_embedding_path(&self, student_id: i64, path: &Path) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE students SET embedding_path = ?1 WHERE id = ?2",
            params![path.to_string_lossy(), student_id],
        )?;
        Ok(())
    }

    /// Deletes a student by roll number, returning the removed record
    /// so the caller can clean up the embedding file. Attendance rows
    /// cascade.
    pub fn remove_student(&self, roll_number: &str) -> Result<Option<StudentRecord>, StoreError> {
        let Some(student) = self.student_by_roll(roll_number)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM students WHERE id = ?1", params![student.id])?;
        Ok(Some(student))
    }
}
