use serde::{Deserialize, Serialize};

/// One tracked file. The durable source of truth for its upload lifecycle:
/// workers never cache status in memory across tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    /// Path relative to the source root. Doubles as the record key.
    pub path: String,
    pub status: UploadStatus,
    /// Unix epoch seconds of the last status transition.
    pub last_modified: i64,
}

impl FileRecord {
    /// Seconds elapsed since the last status transition.
    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.last_modified
    }
}

/// Lifecycle: `Pending → Uploading → {Uploaded | Error}`.
/// `Error` rows may be re-queued back to `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Error,
}

impl UploadStatus {
    /// Stable string form used in the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Error => "error",
        }
    }

    /// Inverse of [`as_str`](Self::as_str). Total over the stored values.
    pub fn parse(s: &str) -> Option<UploadStatus> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "uploading" => Some(UploadStatus::Uploading),
            "uploaded" => Some(UploadStatus::Uploaded),
            "error" => Some(UploadStatus::Error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_round_trips() {
        for status in [
            UploadStatus::Pending,
            UploadStatus::Uploading,
            UploadStatus::Uploaded,
            UploadStatus::Error,
        ] {
            assert_eq!(UploadStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn unknown_status_rejected() {
        assert_eq!(UploadStatus::parse("done"), None);
        assert_eq!(UploadStatus::parse(""), None);
    }

    #[test]
    fn age_is_relative_to_last_transition() {
        let rec = FileRecord {
            path: "a/b.txt".into(),
            status: UploadStatus::Pending,
            last_modified: 1_000,
        };
        assert_eq!(rec.age_secs(1_400), 400);
    }
}
