// 🪞 External mirror - spreadsheet-backed copy of the registry
//
// Wire protocol (one JSON array of records per sheet):
//   GET   {url}                        -> every record
//   PUT   {url}                        <- full snapshot, replaces the sheet contents
//   PATCH {url}/full_name/{name}       <- {"status": "..."} for one record

use crate::error::{MirrorError, MirrorResult};
use crate::model::{format_timestamp, parse_timestamp, RawArea, Registrant, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

// ============================================================================
// WIRE RECORD
// ============================================================================

/// Registrant as stored in the sheet. Cells come back as strings more often
/// than not, so every field is read leniently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub full_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub church: String,
    #[serde(default)]
    pub area: Option<RawArea>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub group_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl From<&Registrant> for MirrorRecord {
    fn from(r: &Registrant) -> Self {
        MirrorRecord {
            full_name: r.full_name.clone(),
            church: r.church.clone(),
            area: Some(RawArea::Int(r.area)),
            group_id: r.group_id.clone(),
            status: Some(r.status.as_str().to_string()),
            last_updated: Some(format_timestamp(r.last_updated)),
        }
    }
}

impl MirrorRecord {
    /// Turn a sheet row back into a registrant. Missing status means Pending;
    /// a missing timestamp is replaced by `now` and a later one is clamped to it.
    pub fn to_registrant(&self, now: DateTime<Utc>) -> Result<Registrant, String> {
        let full_name = self.full_name.trim();
        if full_name.is_empty() {
            return Err("record has no full_name".to_string());
        }

        let area = self
            .area
            .as_ref()
            .and_then(RawArea::parse)
            .ok_or_else(|| format!("record '{}' has no usable area", full_name))?;

        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => Status::Pending,
            Some(raw) => Status::parse(raw)
                .ok_or_else(|| format!("record '{}' has unknown status '{}'", full_name, raw))?,
        };

        let last_updated = self
            .last_updated
            .as_deref()
            .and_then(parse_timestamp)
            .map_or(now, |stamp| stamp.min(now));

        Ok(Registrant {
            full_name: full_name.to_string(),
            church: self.church.trim().to_string(),
            area,
            group_id: self.group_id.trim().to_string(),
            status,
            last_updated,
        })
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Cell {
        Text(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Option::<Cell>::deserialize(deserializer)? {
        None => String::new(),
        Some(Cell::Text(s)) => s,
        Some(Cell::Int(n)) => n.to_string(),
        Some(Cell::Float(f)) => f.to_string(),
        Some(Cell::Bool(b)) => b.to_string(),
    })
}

// ============================================================================
// MIRROR TRAIT
// ============================================================================

#[async_trait]
pub trait Mirror: Send + Sync {
    async fn fetch_all(&self) -> MirrorResult<Vec<MirrorRecord>>;

    /// Replace the mirror contents with `records`
    async fn push_snapshot(&self, records: &[MirrorRecord]) -> MirrorResult<()>;

    async fn patch_status(&self, full_name: &str, status: Status) -> MirrorResult<()>;

    /// Short label for logs
    fn describe(&self) -> String;
}

// ============================================================================
// SHEET MIRROR (HTTP)
// ============================================================================

pub struct SheetMirror {
    client: Client,
    base_url: String,
}

impl SheetMirror {
    /// Every request made through this mirror is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> MirrorResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(SheetMirror {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn record_url(&self, full_name: &str) -> String {
        format!("{}/full_name/{}", self.base_url, urlencoding::encode(full_name))
    }
}

fn ensure_success(response: Response) -> MirrorResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(MirrorError::Status {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}

#[async_trait]
impl Mirror for SheetMirror {
    async fn fetch_all(&self) -> MirrorResult<Vec<MirrorRecord>> {
        let response = ensure_success(self.client.get(&self.base_url).send().await?)?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| MirrorError::Decode(e.to_string()))
    }

    async fn push_snapshot(&self, records: &[MirrorRecord]) -> MirrorResult<()> {
        let response = self.client.put(&self.base_url).json(records).send().await?;
        ensure_success(response)?;
        Ok(())
    }

    async fn patch_status(&self, full_name: &str, status: Status) -> MirrorResult<()> {
        let response = self
            .client
            .patch(self.record_url(full_name))
            .json(&serde_json::json!({ "status": status.as_str() }))
            .send()
            .await?;
        ensure_success(response)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

/// Used when no mirror URL is configured: nothing to recover, nothing to push.
pub struct NoMirror;

#[async_trait]
impl Mirror for NoMirror {
    async fn fetch_all(&self) -> MirrorResult<Vec<MirrorRecord>> {
        Ok(Vec::new())
    }

    async fn push_snapshot(&self, _records: &[MirrorRecord]) -> MirrorResult<()> {
        Ok(())
    }

    async fn patch_status(&self, _full_name: &str, _status: Status) -> MirrorResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "disabled".to_string()
    }
}

// ============================================================================
// IN-MEMORY MIRROR (tests)
// ============================================================================

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Records every call; can be told to fail like an unreachable sheet.
    #[derive(Default)]
    pub struct MemoryMirror {
        pub records: Mutex<Vec<MirrorRecord>>,
        pub pushes: Mutex<Vec<Vec<MirrorRecord>>>,
        pub patches: Mutex<Vec<(String, Status)>>,
        failing: AtomicBool,
    }

    impl MemoryMirror {
        pub fn with_records(records: Vec<MirrorRecord>) -> Self {
            let mirror = MemoryMirror::default();
            *mirror.records.lock().unwrap() = records;
            mirror
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn push_count(&self) -> usize {
            self.pushes.lock().unwrap().len()
        }

        pub fn last_push(&self) -> Option<Vec<MirrorRecord>> {
            self.pushes.lock().unwrap().last().cloned()
        }

        fn check(&self) -> MirrorResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(MirrorError::Status {
                    status: 503,
                    url: "memory://mirror".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Mirror for MemoryMirror {
        async fn fetch_all(&self) -> MirrorResult<Vec<MirrorRecord>> {
            self.check()?;
            Ok(self.records.lock().unwrap().clone())
        }

        async fn push_snapshot(&self, records: &[MirrorRecord]) -> MirrorResult<()> {
            self.check()?;
            *self.records.lock().unwrap() = records.to_vec();
            self.pushes.lock().unwrap().push(records.to_vec());
            Ok(())
        }

        async fn patch_status(&self, full_name: &str, status: Status) -> MirrorResult<()> {
            self.check()?;
            self.patches
                .lock()
                .unwrap()
                .push((full_name.to_string(), status));
            Ok(())
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }
}
