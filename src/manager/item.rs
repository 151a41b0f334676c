//! Download item types and schedule state definitions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::download::{ContentLength, Protocol};
use crate::headers::Headers;

/// Schedule state of an item. The numeric encoding is stable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ScheduleState {
    /// Not scheduled.
    #[default]
    None,
    /// Waiting for its scheduled time.
    Scheduled,
    /// The scheduled time fired and the download was started.
    Triggered,
    /// The scheduled time passed while the process was down.
    Missed,
    /// The schedule was cancelled.
    Cancelled,
}

impl From<ScheduleState> for u8 {
    fn from(s: ScheduleState) -> Self {
        match s {
            ScheduleState::None => 0,
            ScheduleState::Scheduled => 1,
            ScheduleState::Triggered => 2,
            ScheduleState::Missed => 3,
            ScheduleState::Cancelled => 4,
        }
    }
}

impl TryFrom<u8> for ScheduleState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Scheduled),
            2 => Ok(Self::Triggered),
            3 => Ok(Self::Missed),
            4 => Ok(Self::Cancelled),
            other => Err(format!("invalid schedule state: {other}")),
        }
    }
}

/// Per-segment record of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPart {
    /// Opaque part hash, unique within the item.
    pub hash: String,
    /// Inclusive end byte of the part's range.
    pub final_offset: i64,
    /// Whether the part has been spliced into the destination.
    #[serde(default)]
    pub compiled: bool,
}

/// The durable unit of work tracked by the Manager.
///
/// Every field except the in-memory part index survives restarts; the
/// index is rebuilt from `parts` after load. The live downloader handle
/// lives in the Manager's handle table, keyed by `hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Unique key of this item.
    pub hash: String,
    /// Destination file name.
    pub name: String,
    /// Source URL with userinfo stripped.
    pub url: String,
    /// Unix seconds when the item was added.
    pub date_added: u64,
    /// Total size; `-1` when unknown.
    pub total_size: ContentLength,
    /// Bytes transferred so far.
    pub downloaded: ContentLength,
    /// Segment workspace directory.
    pub download_location: PathBuf,
    /// Final destination directory.
    pub absolute_location: PathBuf,
    /// Whether the remote supports ranged/offset transfers.
    pub resumable: bool,
    /// Wire protocol; absent in older records, which decode as HTTP.
    #[serde(default)]
    pub protocol: Protocol,
    /// Parts keyed by initial offset; `None` once the item completed.
    #[serde(default)]
    pub parts: Option<BTreeMap<i64, ItemPart>>,
    /// Request headers replayed on resume.
    #[serde(default)]
    pub headers: Headers,
    /// Hash of the linked child item, if any.
    #[serde(default)]
    pub child_hash: Option<String>,
    /// Whether this entry is a child of another item.
    #[serde(default)]
    pub children: bool,
    /// Hidden from public listings.
    #[serde(default)]
    pub hidden: bool,
    /// Schedule state of the item.
    #[serde(default)]
    pub schedule_state: ScheduleState,
    /// Unix seconds of the scheduled start.
    #[serde(default)]
    pub scheduled_at: Option<u64>,
    /// Cron expression driving a recurring schedule.
    #[serde(default)]
    pub cron_expr: Option<String>,
    /// Cookie file folded into the headers at add/resume time.
    #[serde(default)]
    pub cookie_source_path: Option<PathBuf>,
    /// Runtime index from part hash to initial offset; never persisted.
    #[serde(skip)]
    pub(crate) mem_part: HashMap<String, i64>,
}

impl Item {
    /// Destination file path.
    #[must_use]
    pub fn save_path(&self) -> PathBuf {
        self.absolute_location.join(&self.name)
    }

    /// Whether the item finished: all bytes present and every remaining
    /// part compiled (or the parts cleared).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let bytes_done = self.total_size.is_known() && self.downloaded >= self.total_size;
        let parts_done = self
            .parts
            .as_ref()
            .is_none_or(|parts| parts.values().all(|p| p.compiled));
        bytes_done && parts_done
    }

    /// Registers (or replaces) a part and updates the runtime index.
    pub fn add_part(&mut self, init_offset: i64, part: ItemPart) {
        self.mem_part.insert(part.hash.clone(), init_offset);
        self.parts
            .get_or_insert_with(BTreeMap::new)
            .insert(init_offset, part);
    }

    /// Initial offset of a part by its hash.
    #[must_use]
    pub fn part_offset(&self, part_hash: &str) -> Option<i64> {
        self.mem_part.get(part_hash).copied()
    }

    /// Marks one part compiled.
    pub fn mark_part_compiled(&mut self, part_hash: &str) {
        if let Some(offset) = self.part_offset(part_hash) {
            if let Some(parts) = self.parts.as_mut() {
                if let Some(part) = parts.get_mut(&offset) {
                    part.compiled = true;
                }
            }
        }
    }

    /// Adds transferred bytes to the progress counter.
    pub fn add_progress(&mut self, bytes: u64) {
        let current = self.downloaded.as_i64().max(0);
        let added = i64::try_from(bytes).unwrap_or(0);
        self.downloaded = ContentLength::known(current + added);
    }

    /// Freezes the item as done: byte counters pinned to the total and
    /// parts cleared.
    pub fn mark_complete(&mut self, total_bytes: i64) {
        self.total_size = ContentLength::known(total_bytes);
        self.downloaded = ContentLength::known(total_bytes);
        self.parts = None;
        self.mem_part.clear();
    }

    /// Rebuilds the runtime part index from the persisted parts map.
    pub(crate) fn populate_mem_part(&mut self) {
        self.mem_part.clear();
        if let Some(parts) = &self.parts {
            for (offset, part) in parts {
                self.mem_part.insert(part.hash.clone(), *offset);
            }
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Item {{ hash: {}, name: {}, url: {}, downloaded: {}/{} }}",
            self.hash, self.name, self.url, self.downloaded, self.total_size
        )
    }
}

/// Derives an item hash from the URL plus a random nonce: the first 16
/// hex characters of a SHA-256.
#[must_use]
pub fn derive_item_hash(url: &str) -> String {
    let nonce: [u8; 16] = rand::thread_rng().r#gen();
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(nonce);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Random 16-hex part hash, unique within an item.
#[must_use]
pub fn new_part_hash() -> String {
    let nonce: [u8; 8] = rand::thread_rng().r#gen();
    let mut out = String::with_capacity(16);
    for byte in &nonce {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
