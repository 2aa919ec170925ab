pub mod test_objects;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay, EnumIter, EnumString};

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Pointer to a stored object. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub key: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The file-owning entities of the server. Each kind owns a fixed set of file
/// fields.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRefStr,
    StrumDisplay,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordKind {
    Crash,
    Feedback,
    Symbols,
    OmahaVersion,
    SparkleVersion,
}

impl RecordKind {
    pub fn file_fields(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Crash => &["archive", "upload_file_minidump"],
            RecordKind::Feedback => &["screenshot", "blackbox", "system_logs", "attached_file"],
            RecordKind::Symbols => &["file"],
            RecordKind::OmahaVersion => &["file"],
            RecordKind::SparkleVersion => &["file"],
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.file_fields().contains(&field)
    }
}

/// Raw content destined for one file field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub filename: String,
    pub content: Bytes,
}

impl Upload {
    pub fn new(filename: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// A record to be created together with the content of its file fields.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct NewRecord {
    pub kind: RecordKind,
    #[builder(default)]
    pub id: Option<RecordId>,
    #[builder(default)]
    pub created_at: Option<u64>,
    #[builder(default)]
    pub files: BTreeMap<String, Upload>,
}

impl NewRecord {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            id: None,
            created_at: None,
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, field: &str, upload: Upload) -> Self {
        self.files.insert(field.to_string(), upload);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    /// Every file field of the kind is present; `None` means no file.
    pub fields: BTreeMap<String, Option<BlobRef>>,
    pub created_at: u64,
    /// Set when a delete could not remove every blob. The remaining fields are
    /// the blobs still to be deleted.
    #[serde(default)]
    pub tombstoned: bool,
}

impl AttachmentRecord {
    pub fn new(id: RecordId, kind: RecordKind, created_at: u64) -> Self {
        let fields = kind
            .file_fields()
            .iter()
            .map(|field| (field.to_string(), None))
            .collect();
        Self {
            id,
            kind,
            fields,
            created_at,
            tombstoned: false,
        }
    }

    pub fn field(&self, field: &str) -> Option<&BlobRef> {
        self.fields.get(field).and_then(|blob| blob.as_ref())
    }

    pub fn blob_refs(&self) -> impl Iterator<Item = (&str, &BlobRef)> {
        self.fields
            .iter()
            .filter_map(|(field, blob)| blob.as_ref().map(|b| (field.as_str(), b)))
    }

    pub fn keys(&self) -> Vec<String> {
        self.blob_refs().map(|(_, b)| b.key.clone()).collect()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.blob_refs().map(|(_, b)| b.size_bytes).sum()
    }

    /// Clears every field whose blob key is not in `keep`.
    pub fn retain_keys(&mut self, keep: &BTreeSet<String>) {
        for blob in self.fields.values_mut() {
            if blob.as_ref().is_some_and(|b| !keep.contains(&b.key)) {
                *blob = None;
            }
        }
    }
}

/// Storage key for a field's content:
/// `{kind}/{field}/{record_id}/{nonce}/{filename}`.
///
/// The nonce guarantees that a replacement never reuses the previous key.
pub fn blob_key(kind: RecordKind, field: &str, id: &RecordId, filename: &str) -> String {
    let filename = sanitize_filename(filename);
    format!(
        "{}/{}/{}/{}/{}",
        kind.as_ref(),
        field,
        id,
        nanoid::nanoid!(10, &nanoid::alphabet::SAFE),
        filename
    )
}

// Characters object stores percent-encode in paths are replaced so a key lists
// back exactly as it was written.
const RESERVED_KEY_CHARS: &[char] = &[
    '/', '\\', '{', '^', '}', '%', '`', ']', '"', '>', '[', '~', '<', '#', '|', '*', '?',
];

fn sanitize_filename(filename: &str) -> String {
    let name: String = filename
        .trim()
        .chars()
        .map(|c| {
            if c.is_control() || RESERVED_KEY_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    match name.as_str() {
        "" | "." | ".." => "blob".to_string(),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_kind_string_forms() {
        assert_eq!(RecordKind::OmahaVersion.as_ref(), "omaha_version");
        assert_eq!(
            RecordKind::from_str("sparkle_version").unwrap(),
            RecordKind::SparkleVersion
        );
        let json = serde_json::to_string(&RecordKind::Crash).unwrap();
        assert_eq!(json, "\"crash\"");
        for kind in RecordKind::iter() {
            assert!(!kind.file_fields().is_empty());
        }
    }

    #[test]
    fn test_new_record_has_all_fields_empty() {
        let record = AttachmentRecord::new("r1".into(), RecordKind::Feedback, 0);
        assert_eq!(record.fields.len(), 4);
        assert!(record.blob_refs().next().is_none());
        assert_eq!(record.total_size_bytes(), 0);
    }

    #[test]
    fn test_retain_keys() {
        let mut record = AttachmentRecord::new("r1".into(), RecordKind::Crash, 0);
        for (i, field) in ["archive", "upload_file_minidump"].iter().enumerate() {
            record.fields.insert(
                field.to_string(),
                Some(BlobRef {
                    key: format!("k{}", i),
                    size_bytes: 3,
                    sha256_hash: String::new(),
                }),
            );
        }
        assert_eq!(record.total_size_bytes(), 6);

        record.retain_keys(&BTreeSet::from(["k1".to_string()]));
        assert!(record.field("archive").is_none());
        assert_eq!(record.keys(), vec!["k1".to_string()]);
    }

    #[test]
    fn test_blob_key_layout() {
        let id = RecordId::from("abc");
        let first = blob_key(RecordKind::Symbols, "file", &id, "Bar Baz.pdb");
        let second = blob_key(RecordKind::Symbols, "file", &id, "Bar Baz.pdb");
        assert!(first.starts_with("symbols/file/abc/"));
        assert!(first.ends_with("/Bar Baz.pdb"));
        assert_ne!(first, second);

        let key = blob_key(RecordKind::Crash, "archive", &id, "../x/y.zip");
        assert!(key.ends_with("/.._x_y.zip"));
        let key = blob_key(RecordKind::Crash, "archive", &id, "  ");
        assert!(key.ends_with("/blob"));
    }
}
