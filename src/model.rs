// 🧾 Data model - Registrants, approval status and derived group views

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// STATUS
// ============================================================================

/// Approval state. Only ever moves Pending -> Approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    #[default]
    Pending,
    Approved,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Approved => "Approved",
        }
    }

    /// Lenient parse used for values typed by humans into the mirror.
    pub fn parse(value: &str) -> Option<Status> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Status::Pending),
            "approved" => Some(Status::Approved),
            _ => None,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Status::Approved)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Status::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown status '{}'", text).into()))
    }
}

// ============================================================================
// REGISTRANT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registrant {
    /// Natural key, unique across the whole store
    pub full_name: String,
    pub church: String,
    pub area: i64,
    /// Shared by every member of one batch; never changes
    pub group_id: String,
    pub status: Status,
    /// Set on creation and on every status change; used as the sync cursor
    pub last_updated: DateTime<Utc>,
}

impl Registrant {
    pub fn new_pending(
        full_name: &str,
        church: &str,
        area: i64,
        group_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Registrant {
            full_name: full_name.to_string(),
            church: church.to_string(),
            area,
            group_id: group_id.to_string(),
            status: Status::Pending,
            last_updated: now,
        }
    }
}

// ============================================================================
// RAW AREA (as submitted by forms or read back from the spreadsheet)
// ============================================================================

/// Area value before validation. Forms post `"3"`, JSON clients post `3`,
/// spreadsheets sometimes hand back `3.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawArea {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawArea {
    pub fn parse(&self) -> Option<i64> {
        match self {
            RawArea::Int(n) => Some(*n),
            RawArea::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            RawArea::Float(_) => None,
            RawArea::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<i64> for RawArea {
    fn from(n: i64) -> Self {
        RawArea::Int(n)
    }
}

impl From<&str> for RawArea {
    fn from(s: &str) -> Self {
        RawArea::Text(s.to_string())
    }
}

// ============================================================================
// DERIVED VIEWS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub name: String,
    pub status: Status,
}

/// Group view computed on read; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub group_id: String,
    pub members: Vec<MemberStatus>,
    /// Vacuously true for an empty or unknown group
    pub all_approved: bool,
}

impl GroupStatus {
    pub fn from_members(group_id: &str, members: Vec<MemberStatus>) -> Self {
        let all_approved = members.iter().all(|m| m.status.is_approved());
        GroupStatus {
            group_id: group_id.to_string(),
            members,
            all_approved,
        }
    }
}

/// One line of the admin listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminRow {
    pub full_name: String,
    pub church: String,
    pub area: i64,
    pub status: Status,
}

impl From<Registrant> for AdminRow {
    fn from(r: Registrant) -> Self {
        AdminRow {
            full_name: r.full_name,
            church: r.church,
            area: r.area,
            status: r.status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AdminFilter {
    #[serde(default)]
    pub church: Option<String>,
    #[serde(default)]
    pub area: Option<i64>,
}

impl AdminFilter {
    pub fn matches(&self, row: &AdminRow) -> bool {
        self.church.as_deref().map_or(true, |c| row.church == c)
            && self.area.map_or(true, |a| row.area == a)
    }
}

/// Distinct values offered as admin filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdminFilters {
    pub churches: Vec<String>,
    pub areas: Vec<i64>,
}

// ============================================================================
// HELPERS
// ============================================================================

/// Group id: millisecond timestamp plus a random suffix, so two batches
/// admitted within the same clock tick still get different ids.
pub fn new_group_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%d%H%M%S%3f"), &suffix[..8])
}

/// Fixed-width RFC 3339 so lexical MAX() in SQL matches time order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_parse_is_lenient() {
        assert_eq!(Status::parse("Approved"), Some(Status::Approved));
        assert_eq!(Status::parse(" pending "), Some(Status::Pending));
        assert_eq!(Status::parse("rejected"), None);
    }

    #[test]
    fn test_raw_area_parsing() {
        assert_eq!(RawArea::Int(3).parse(), Some(3));
        assert_eq!(RawArea::Float(4.0).parse(), Some(4));
        assert_eq!(RawArea::Float(4.5).parse(), None);
        assert_eq!(RawArea::from(" 7 ").parse(), Some(7));
        assert_eq!(RawArea::from("seven").parse(), None);
    }

    #[test]
    fn test_raw_area_deserializes_numbers_and_strings() {
        let n: RawArea = serde_json::from_str("5").unwrap();
        let s: RawArea = serde_json::from_str("\"5\"").unwrap();
        assert_eq!(n.parse(), Some(5));
        assert_eq!(s.parse(), Some(5));
    }

    #[test]
    fn test_group_ids_differ_within_same_tick() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        let a = new_group_id(now);
        let b = new_group_id(now);

        assert_ne!(a, b);
        assert!(a.starts_with("20250301093000000-"));
        assert_eq!(a.len(), "20250301093000000-".len() + 8);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let late = early + chrono::Duration::microseconds(1);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert_eq!(parse_timestamp(&format_timestamp(late)), Some(late));
    }

    #[test]
    fn test_group_status_all_approved() {
        let members = vec![
            MemberStatus { name: "Ann Lee".into(), status: Status::Approved },
            MemberStatus { name: "Ben Cruz".into(), status: Status::Pending },
        ];
        assert!(!GroupStatus::from_members("g", members).all_approved);
        assert!(GroupStatus::from_members("unknown", vec![]).all_approved);
    }

    #[test]
    fn test_admin_filter_matches() {
        let row = AdminRow {
            full_name: "Ann Lee".into(),
            church: "Grace Chapel".into(),
            area: 3,
            status: Status::Pending,
        };
        assert!(AdminFilter::default().matches(&row));
        assert!(AdminFilter { church: Some("Grace Chapel".into()), area: Some(3) }.matches(&row));
        assert!(!AdminFilter { church: None, area: Some(4) }.matches(&row));
    }
}
