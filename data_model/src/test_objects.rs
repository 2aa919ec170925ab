pub mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;

    use crate::{NewRecord, NewRecordBuilder, RecordKind, Upload};

    pub const TEST_MINIDUMP: &[u8] = b"MDMP\x93\xa7\x00\x00minidump-body";
    pub const TEST_SYMBOLS_FILENAME: &str = "BreakpadTestApp.exe.sym with spaces";

    fn mock_filename(kind: RecordKind, field: &str) -> String {
        match (kind, field) {
            (RecordKind::Crash, "upload_file_minidump") => "7b05e196.dmp".to_string(),
            (RecordKind::Crash, "archive") => "7b05e196.zip".to_string(),
            (RecordKind::Feedback, "screenshot") => "screenshot.png".to_string(),
            (RecordKind::Symbols, _) => TEST_SYMBOLS_FILENAME.to_string(),
            (RecordKind::OmahaVersion, _) => "ChromeSetup.exe".to_string(),
            (RecordKind::SparkleVersion, _) => "Chrome.dmg".to_string(),
            (_, field) => format!("{}.bin", field),
        }
    }

    fn mock_content(kind: RecordKind, field: &str) -> Bytes {
        match field {
            "upload_file_minidump" => Bytes::from_static(TEST_MINIDUMP),
            _ => Bytes::from(format!("{} {} {}", kind, field, nanoid::nanoid!())),
        }
    }

    /// A new record of `kind` with content for every file field.
    pub fn mock_new_record(kind: RecordKind) -> NewRecord {
        let files: BTreeMap<String, Upload> = kind
            .file_fields()
            .iter()
            .map(|field| {
                (
                    field.to_string(),
                    Upload::new(mock_filename(kind, field), mock_content(kind, field)),
                )
            })
            .collect();
        NewRecordBuilder::default()
            .kind(kind)
            .files(files)
            .build()
            .unwrap()
    }

    pub fn mock_upload(kind: RecordKind, field: &str) -> Upload {
        Upload::new(mock_filename(kind, field), mock_content(kind, field))
    }

    pub fn mock_new_records(kind: RecordKind, count: usize) -> Vec<NewRecord> {
        (0..count).map(|_| mock_new_record(kind)).collect()
    }
}
