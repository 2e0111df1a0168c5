use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::content::ContentRef;

/// Permanent unlock of one content item.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnlockRecord {
    pub content: ContentRef,
    pub permanent: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub unlocked_at: OffsetDateTime,
}

impl UnlockRecord {
    #[must_use]
    pub fn permanent(content: ContentRef, unlocked_at: OffsetDateTime) -> Self {
        Self {
            content,
            permanent: true,
            unlocked_at,
        }
    }

    /// Result of unlocking again: an existing permanent record always wins.
    #[must_use]
    pub fn merge(existing: Option<&Self>, content: ContentRef, at: OffsetDateTime) -> UnlockResult {
        match existing {
            Some(record) if record.permanent => UnlockResult {
                record: record.clone(),
                newly_unlocked: false,
            },
            _ => UnlockResult {
                record: Self::permanent(content, at),
                newly_unlocked: true,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnlockResult {
    pub record: UnlockRecord,
    pub newly_unlocked: bool,
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::content::ContentType;

    #[test]
    fn second_unlock_keeps_first_timestamp() {
        let content = match ContentRef::new(ContentType::TarotSpread, "celtic-cross") {
            Ok(value) => value,
            Err(err) => panic!("expected content ref: {err}"),
        };
        let first_at = OffsetDateTime::UNIX_EPOCH;
        let first = UnlockRecord::merge(None, content.clone(), first_at);
        assert!(first.newly_unlocked);

        let again = UnlockRecord::merge(
            Some(&first.record),
            content,
            first_at + Duration::hours(3),
        );
        assert!(!again.newly_unlocked);
        assert!(again.record.permanent);
        assert_eq!(again.record.unlocked_at, first_at);
    }
}
