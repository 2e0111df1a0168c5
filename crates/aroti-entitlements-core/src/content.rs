use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::EntitlementError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ContentType {
    AiChat,
    DailyPractice,
    TarotSpread,
    Article,
    Quiz,
    NumerologyLayer,
    Theme,
    PremiumForecast,
    LearningLesson,
    DailyRitual,
    Course,
    Compatibility,
}

impl ContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AiChat => "aiChat",
            Self::DailyPractice => "dailyPractice",
            Self::TarotSpread => "tarotSpread",
            Self::Article => "article",
            Self::Quiz => "quiz",
            Self::NumerologyLayer => "numerologyLayer",
            Self::Theme => "theme",
            Self::PremiumForecast => "premiumForecast",
            Self::LearningLesson => "learningLesson",
            Self::DailyRitual => "dailyRitual",
            Self::Course => "course",
            Self::Compatibility => "compatibility",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "aiChat" => Some(Self::AiChat),
            "dailyPractice" => Some(Self::DailyPractice),
            "tarotSpread" => Some(Self::TarotSpread),
            "article" => Some(Self::Article),
            "quiz" => Some(Self::Quiz),
            "numerologyLayer" => Some(Self::NumerologyLayer),
            "theme" => Some(Self::Theme),
            "premiumForecast" => Some(Self::PremiumForecast),
            "learningLesson" => Some(Self::LearningLesson),
            "dailyRitual" => Some(Self::DailyRitual),
            "course" => Some(Self::Course),
            "compatibility" => Some(Self::Compatibility),
            _ => None,
        }
    }
}

/// Key of an unlockable content item.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContentRef {
    pub content_type: ContentType,
    pub content_id: String,
}

impl ContentRef {
    /// Builds a content key, rejecting blank ids and ids containing `:`.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] for malformed content ids.
    pub fn new(content_type: ContentType, content_id: &str) -> Result<Self, EntitlementError> {
        let trimmed = content_id.trim();
        if trimmed.is_empty() {
            return Err(EntitlementError::Validation(
                "content_id MUST be provided".to_string(),
            ));
        }

        if trimmed.contains(':') {
            return Err(EntitlementError::Validation(format!(
                "content_id MUST NOT contain ':': {trimmed}"
            )));
        }

        Ok(Self {
            content_type,
            content_id: trimmed.to_string(),
        })
    }

    /// Parses `<contentType>:<contentId>`.
    ///
    /// # Errors
    /// Returns [`EntitlementError::Validation`] when the format or content
    /// type is invalid.
    pub fn parse(raw: &str) -> Result<Self, EntitlementError> {
        let Some((content_type_raw, content_id)) = raw.split_once(':') else {
            return Err(EntitlementError::Validation(
                "content must be in <contentType>:<contentId> format".to_string(),
            ));
        };

        let content_type = ContentType::parse(content_type_raw).ok_or_else(|| {
            EntitlementError::Validation(format!("unknown content type: {content_type_raw}"))
        })?;

        Self::new(content_type, content_id)
    }
}

impl Display for ContentRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.content_type.as_str(), self.content_id)
    }
}
