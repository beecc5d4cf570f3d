use crate::db;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRules {
    pub min_value: i64,
    pub points_by_value: BTreeMap<i64, i64>,
}

impl GradeRules {
    /// Points for a posted grade: the exact value's entry, else the entry
    /// of the highest configured value below it.
    pub fn points_for(&self, value: i64) -> Option<i64> {
        if value < self.min_value {
            return None;
        }
        self.points_by_value
            .range(..=value)
            .next_back()
            .map(|(_, p)| *p)
            .filter(|p| *p > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeworkRules {
    pub on_time_points: i64,
    pub late_points: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub days: u32,
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRules {
    pub milestones: Vec<Milestone>,
}

impl AttendanceRules {
    pub fn reached(&self, streak_length: u32) -> impl Iterator<Item = &Milestone> {
        self.milestones
            .iter()
            .filter(move |m| m.days <= streak_length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockingRules {
    pub timeout_ms: u64,
    pub busy_retries: u32,
    pub retry_backoff_ms: u64,
}

impl LockingRules {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << attempt.min(10)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsConfig {
    pub grades: GradeRules,
    pub homework: HomeworkRules,
    pub attendance: AttendanceRules,
    pub locking: LockingRules,
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            grades: GradeRules {
                min_value: 4,
                points_by_value: BTreeMap::from([(4, 5), (5, 10)]),
            },
            homework: HomeworkRules {
                on_time_points: 5,
                late_points: 0,
            },
            attendance: AttendanceRules {
                milestones: vec![
                    Milestone { days: 5, points: 5 },
                    Milestone { days: 10, points: 10 },
                    Milestone { days: 20, points: 25 },
                    Milestone { days: 30, points: 40 },
                ],
            },
            locking: LockingRules {
                timeout_ms: 2000,
                busy_retries: 3,
                retry_backoff_ms: 25,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Grades,
    Homework,
    Attendance,
    Locking,
}

impl SetupSection {
    pub const ALL: [SetupSection; 4] = [
        SetupSection::Grades,
        SetupSection::Homework,
        SetupSection::Attendance,
        SetupSection::Locking,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grades" => Some(Self::Grades),
            "homework" => Some(Self::Homework),
            "attendance" => Some(Self::Attendance),
            "locking" => Some(Self::Locking),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Grades => "grades",
            Self::Homework => "homework",
            Self::Attendance => "attendance",
            Self::Locking => "locking",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grades => "setup.grades",
            Self::Homework => "setup.homework",
            Self::Attendance => "setup.attendance",
            Self::Locking => "setup.locking",
        }
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_points_by_value(v: &Value) -> Result<BTreeMap<i64, i64>, String> {
    let obj = v
        .as_object()
        .ok_or_else(|| "pointsByValue must be an object".to_string())?;
    let mut out = BTreeMap::new();
    for (grade, points) in obj {
        let grade: i64 = grade
            .trim()
            .parse()
            .map_err(|_| format!("pointsByValue key {:?} must be an integer grade", grade))?;
        if !(1..=100).contains(&grade) {
            return Err("pointsByValue grades must be in 1..=100".into());
        }
        out.insert(grade, parse_i64_range(points, "pointsByValue entry", 0, 1000)?);
    }
    Ok(out)
}

fn parse_milestones(v: &Value) -> Result<Vec<Milestone>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| "milestones must be an array".to_string())?;
    let mut out: Vec<Milestone> = Vec::with_capacity(arr.len());
    for m in arr {
        let days = m
            .get("days")
            .ok_or_else(|| "milestone missing days".to_string())
            .and_then(|d| parse_i64_range(d, "days", 1, 365))?;
        let points = m
            .get("points")
            .ok_or_else(|| "milestone missing points".to_string())
            .and_then(|p| parse_i64_range(p, "points", 1, 1000))?;
        let days = days as u32;
        if out.iter().any(|e| e.days == days) {
            return Err(format!("duplicate milestone for {} days", days));
        }
        out.push(Milestone { days, points });
    }
    out.sort_by_key(|m| m.days);
    Ok(out)
}

/// Applies a client patch to one section, validating every field.
pub fn merge_section_patch(
    section: SetupSection,
    config: &mut PointsConfig,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let mut next = config.clone();
    for (k, v) in patch {
        match section {
            SetupSection::Grades => match k.as_str() {
                "minValue" => next.grades.min_value = parse_i64_range(v, k, 1, 100)?,
                "pointsByValue" => next.grades.points_by_value = parse_points_by_value(v)?,
                _ => return Err(format!("unknown grades field: {}", k)),
            },
            SetupSection::Homework => match k.as_str() {
                "onTimePoints" => next.homework.on_time_points = parse_i64_range(v, k, 0, 1000)?,
                "latePoints" => next.homework.late_points = parse_i64_range(v, k, 0, 1000)?,
                _ => return Err(format!("unknown homework field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "milestones" => next.attendance.milestones = parse_milestones(v)?,
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Locking => match k.as_str() {
                "timeoutMs" => next.locking.timeout_ms = parse_i64_range(v, k, 10, 60_000)? as u64,
                "busyRetries" => next.locking.busy_retries = parse_i64_range(v, k, 0, 10)? as u32,
                "retryBackoffMs" => {
                    next.locking.retry_backoff_ms = parse_i64_range(v, k, 1, 5000)? as u64
                }
                _ => return Err(format!("unknown locking field: {}", k)),
            },
        }
    }
    if next.homework.late_points > next.homework.on_time_points {
        return Err("latePoints must not exceed onTimePoints".into());
    }
    *config = next;
    Ok(())
}

pub fn section_value(section: SetupSection, config: &PointsConfig) -> Value {
    let v = match section {
        SetupSection::Grades => serde_json::to_value(&config.grades),
        SetupSection::Homework => serde_json::to_value(&config.homework),
        SetupSection::Attendance => serde_json::to_value(&config.attendance),
        SetupSection::Locking => serde_json::to_value(&config.locking),
    };
    v.unwrap_or(Value::Null)
}

/// Defaults overlaid with whatever the workspace has saved.
pub fn load(conn: &Connection) -> anyhow::Result<PointsConfig> {
    let mut config = PointsConfig::default();
    for section in SetupSection::ALL {
        if let Some(saved) = db::settings_get_json(conn, section.key())? {
            if let Some(saved_obj) = saved.as_object() {
                // Malformed historical values fall back to defaults.
                if let Err(e) = merge_section_patch(section, &mut config, saved_obj) {
                    tracing::warn!(section = section.name(), error = %e, "ignoring saved setup");
                }
            }
        }
    }
    Ok(config)
}

pub fn save_section(
    conn: &Connection,
    section: SetupSection,
    config: &PointsConfig,
) -> anyhow::Result<()> {
    db::settings_set_json(conn, section.key(), &section_value(section, config))
}
