use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Sick,
    Permission,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "sick" => Some(Self::Sick),
            "permission" => Some(Self::Permission),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Sick => "sick",
            Self::Permission => "permission",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubmissionState {
    NotSubmitted,
    Submitted,
    Graded(f64),
}

impl SubmissionState {
    pub fn from_row(status: &str, grade: Option<f64>) -> Self {
        match status {
            "graded" => Self::Graded(grade.unwrap_or(0.0)),
            "submitted" => Self::Submitted,
            _ => Self::NotSubmitted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSubmitted => "not_submitted",
            Self::Submitted => "submitted",
            Self::Graded(_) => "graded",
        }
    }
}

/// 1-decimal presentation rounding applied to rates and percents.
pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// present/total as a percentage; 0 for an empty record set, never NaN.
pub fn attendance_rate(present_count: usize, record_count: usize) -> f64 {
    if record_count == 0 {
        return 0.0;
    }
    100.0 * (present_count as f64) / (record_count as f64)
}

/// A-F letter from a percentage. Buckets partition [0, 100]:
/// A >= 90, B >= 80, C >= 70, D >= 60, F below.
pub fn grade_letter(percent: f64) -> &'static str {
    if percent >= 90.0 {
        "A"
    } else if percent >= 80.0 {
        "B"
    } else if percent >= 70.0 {
        "C"
    } else if percent >= 60.0 {
        "D"
    } else {
        "F"
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / (values.len() as f64)
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
struct RosterStudent {
    id: String,
    display_name: String,
    sort_order: i64,
    active: bool,
}

fn load_class(conn: &Connection, class_id: &str) -> Result<ClassSummary, CalcError> {
    let name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some(name) = name else {
        return Err(CalcError::new("not_found", "class not found"));
    };
    Ok(ClassSummary {
        id: class_id.to_string(),
        name,
    })
}

fn load_roster(conn: &Connection, class_id: &str) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([class_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(RosterStudent {
            id: r.get(0)?,
            display_name: format!("{}, {}", last, first),
            sort_order: r.get(3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

// ---------------------------------------------------------------------------
// Attendance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub student_id: String,
    pub display_name: String,
    pub present_count: i64,
    pub record_count: i64,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceModel {
    pub class: ClassSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub date_count: usize,
    pub student_count: usize,
    #[serde(rename = "perStudent")]
    pub per_student: Vec<StudentAttendance>,
    pub class_average_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarDay {
    pub date: String,
    pub present: i64,
    pub total: i64,
}

pub fn compute_attendance_summary(
    ctx: &CalcContext<'_>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<AttendanceModel, CalcError> {
    let conn = ctx.conn;
    let class = load_class(conn, ctx.class_id)?;
    let roster = load_roster(conn, ctx.class_id)?;

    let mut sql = String::from(
        "SELECT student_id, date, status FROM attendance_records WHERE class_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(ctx.class_id.to_string())];
    if let Some(from) = from {
        sql.push_str(" AND date >= ?");
        binds.push(Value::Text(from.to_string()));
    }
    if let Some(to) = to {
        sql.push_str(" AND date <= ?");
        binds.push(Value::Text(to.to_string()));
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let records: Vec<(String, String, String)> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut dates: HashSet<&str> = HashSet::new();
    let mut counts: HashMap<&str, (i64, i64)> = HashMap::new(); // present, total
    for (student_id, date, status) in &records {
        dates.insert(date.as_str());
        let entry = counts.entry(student_id.as_str()).or_insert((0, 0));
        entry.1 += 1;
        if AttendanceStatus::parse(status) == Some(AttendanceStatus::Present) {
            entry.0 += 1;
        }
    }
    let student_count = counts.len();

    let roster_ids: HashSet<&str> = roster.iter().map(|s| s.id.as_str()).collect();

    let mut per_student: Vec<StudentAttendance> = Vec::new();
    for s in &roster {
        let (present, total) = counts.get(s.id.as_str()).copied().unwrap_or((0, 0));
        per_student.push(StudentAttendance {
            student_id: s.id.clone(),
            display_name: s.display_name.clone(),
            present_count: present,
            record_count: total,
            rate: round1(attendance_rate(present as usize, total as usize)),
        });
    }

    // Records can outlive their roster row; mask the name rather than fail.
    let mut orphans: Vec<(&str, (i64, i64))> = counts
        .iter()
        .filter(|(id, _)| !roster_ids.contains(*id))
        .map(|(id, c)| (*id, *c))
        .collect();
    orphans.sort_by(|a, b| a.0.cmp(b.0));
    for (id, (present, total)) in orphans {
        per_student.push(StudentAttendance {
            student_id: id.to_string(),
            display_name: "Unknown".to_string(),
            present_count: present,
            record_count: total,
            rate: round1(attendance_rate(present as usize, total as usize)),
        });
    }

    // Unweighted mean of per-student rates: a student with 2 records counts
    // the same as one with 40.
    let rates: Vec<f64> = per_student
        .iter()
        .map(|s| attendance_rate(s.present_count as usize, s.record_count as usize))
        .collect();
    let class_average_rate = round1(mean(&rates));

    Ok(AttendanceModel {
        class,
        from: from.map(|s| s.to_string()),
        to: to.map(|s| s.to_string()),
        date_count: dates.len(),
        student_count,
        per_student,
        class_average_rate,
    })
}

pub fn compute_attendance_calendar(
    ctx: &CalcContext<'_>,
    month: &str,
) -> Result<Vec<CalendarDay>, CalcError> {
    let conn = ctx.conn;
    load_class(conn, ctx.class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT date, status FROM attendance_records
             WHERE class_id = ? AND date LIKE ? || '-%'",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let rows: Vec<(String, String)> = stmt
        .query_map((ctx.class_id, month), |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut by_date: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    for (date, status) in rows {
        let entry = by_date.entry(date).or_insert((0, 0));
        entry.1 += 1;
        if AttendanceStatus::parse(&status) == Some(AttendanceStatus::Present) {
            entry.0 += 1;
        }
    }

    Ok(by_date
        .into_iter()
        .map(|(date, (present, total))| CalendarDay {
            date,
            present,
            total,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Gradebook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentDef {
    pub assignment_id: String,
    pub title: String,
    pub total_points: f64,
    pub due_date: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradebookCell {
    pub status: &'static str,
    pub grade: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGradeRow {
    pub student_id: String,
    pub display_name: String,
    pub sort_order: i64,
    pub active: bool,
    pub cells: Vec<GradebookCell>,
    pub points_earned: f64,
    pub max_points: f64,
    pub percent: f64,
    pub average_of_percents: f64,
    pub letter: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentStats {
    pub assignment_id: String,
    pub title: String,
    pub total_points: f64,
    pub graded_count: usize,
    pub submitted_count: usize,
    pub average_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GradeDistribution {
    pub a: usize,
    pub b: usize,
    pub c: usize,
    pub d: usize,
    pub f: usize,
    pub ungraded: usize,
}

impl GradeDistribution {
    fn bucket(&mut self, percent: f64) {
        match grade_letter(percent) {
            "A" => self.a += 1,
            "B" => self.b += 1,
            "C" => self.c += 1,
            "D" => self.d += 1,
            _ => self.f += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradebookModel {
    pub class: ClassSummary,
    pub assignments: Vec<AssignmentDef>,
    pub rows: Vec<StudentGradeRow>,
    #[serde(rename = "perAssignment")]
    pub per_assignment: Vec<AssignmentStats>,
    pub distribution: GradeDistribution,
    pub class_average_percent: f64,
}

pub fn compute_gradebook(ctx: &CalcContext<'_>) -> Result<GradebookModel, CalcError> {
    let conn = ctx.conn;
    let class = load_class(conn, ctx.class_id)?;
    let roster = load_roster(conn, ctx.class_id)?;

    let mut assignments_stmt = conn
        .prepare(
            "SELECT id, title, total_points, due_date, sort_order
             FROM assignments
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let assignments: Vec<AssignmentDef> = assignments_stmt
        .query_map([ctx.class_id], |r| {
            Ok(AssignmentDef {
                assignment_id: r.get(0)?,
                title: r.get(1)?,
                total_points: r.get(2)?,
                due_date: r.get(3)?,
                sort_order: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    // Sparse rows keyed by (assignment, student); every absent pair reads as
    // not_submitted when the dense matrix is built below.
    let mut state_by_pair: HashMap<(String, String), SubmissionState> = HashMap::new();
    let mut sub_stmt = conn
        .prepare(
            "SELECT s.assignment_id, s.student_id, s.status, s.grade
             FROM submissions s
             JOIN assignments a ON a.id = s.assignment_id
             WHERE a.class_id = ?",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let sub_rows = sub_stmt
        .query_map([ctx.class_id], |r| {
            let assignment_id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let status: String = r.get(2)?;
            let grade: Option<f64> = r.get(3)?;
            Ok((assignment_id, student_id, status, grade))
        })
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    for row in sub_rows {
        let (assignment_id, student_id, status, grade) =
            row.map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        state_by_pair.insert(
            (assignment_id, student_id),
            SubmissionState::from_row(&status, grade),
        );
    }

    let mut rows: Vec<StudentGradeRow> = Vec::new();
    let mut distribution = GradeDistribution::default();
    let mut class_points = 0.0_f64;
    let mut class_max = 0.0_f64;

    for s in &roster {
        let mut cells: Vec<GradebookCell> = Vec::with_capacity(assignments.len());
        let mut points_earned = 0.0_f64;
        let mut max_points = 0.0_f64;
        let mut cell_percents: Vec<f64> = Vec::new();

        for a in &assignments {
            let state = state_by_pair
                .get(&(a.assignment_id.clone(), s.id.clone()))
                .copied()
                .unwrap_or(SubmissionState::NotSubmitted);
            let grade = match state {
                SubmissionState::Graded(v) => {
                    points_earned += v;
                    max_points += a.total_points;
                    if a.total_points > 0.0 {
                        cell_percents.push(100.0 * v / a.total_points);
                    } else {
                        cell_percents.push(0.0);
                    }
                    Some(v)
                }
                _ => None,
            };
            cells.push(GradebookCell {
                status: state.as_str(),
                grade,
            });
        }

        // Weighted overall: big assignments dominate. The unweighted mean of
        // per-assignment percents is a different figure and both are kept.
        let percent = if max_points > 0.0 {
            100.0 * points_earned / max_points
        } else {
            0.0
        };
        let average_of_percents = mean(&cell_percents);
        let letter = if max_points > 0.0 {
            Some(grade_letter(percent))
        } else {
            None
        };

        if s.active {
            if max_points > 0.0 {
                distribution.bucket(percent);
            } else {
                distribution.ungraded += 1;
            }
            class_points += points_earned;
            class_max += max_points;
        }

        rows.push(StudentGradeRow {
            student_id: s.id.clone(),
            display_name: s.display_name.clone(),
            sort_order: s.sort_order,
            active: s.active,
            cells,
            points_earned,
            max_points,
            percent: round1(percent),
            average_of_percents: round1(average_of_percents),
            letter,
        });
    }

    let mut per_assignment: Vec<AssignmentStats> = Vec::new();
    for (idx, a) in assignments.iter().enumerate() {
        let mut graded_count = 0usize;
        let mut submitted_count = 0usize;
        let mut percents: Vec<f64> = Vec::new();
        for (s, row) in roster.iter().zip(rows.iter()) {
            if !s.active {
                continue;
            }
            match row.cells[idx].status {
                "graded" => {
                    graded_count += 1;
                    if let Some(v) = row.cells[idx].grade {
                        if a.total_points > 0.0 {
                            percents.push(100.0 * v / a.total_points);
                        } else {
                            percents.push(0.0);
                        }
                    }
                }
                "submitted" => submitted_count += 1,
                _ => {}
            }
        }
        per_assignment.push(AssignmentStats {
            assignment_id: a.assignment_id.clone(),
            title: a.title.clone(),
            total_points: a.total_points,
            graded_count,
            submitted_count,
            average_percent: round1(mean(&percents)),
        });
    }

    let class_average_percent = if class_max > 0.0 {
        round1(100.0 * class_points / class_max)
    } else {
        0.0
    };

    Ok(GradebookModel {
        class,
        assignments,
        rows,
        per_assignment,
        distribution,
        class_average_percent,
    })
}
