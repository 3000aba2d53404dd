// System de notifications - User-facing notices (availability, hot-plug, peers)

use serde::Serialize;

/// Niveau de sévérité d'une notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    Audio,
    Midi,
    Peer,
    Engine,
}

/// Notification avec timestamp et métadonnées
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub category: NotificationCategory,
    pub message: String,
    /// Unix timestamp en millisecondes
    pub timestamp: i64,
}

impl Notification {
    pub fn new(level: NotificationLevel, category: NotificationCategory, message: impl Into<String>) -> Self {
        Self {
            level,
            category,
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn info(category: NotificationCategory, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, category, message)
    }

    pub fn warning(category: NotificationCategory, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Warning, category, message)
    }

    pub fn error(category: NotificationCategory, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, category, message)
    }

    /// Mirror the notice into the log at the matching level
    pub fn log(&self) {
        match self.level {
            NotificationLevel::Info => {
                tracing::info!(category = ?self.category, "{}", self.message)
            }
            NotificationLevel::Warning => {
                tracing::warn!(category = ?self.category, "{}", self.message)
            }
            NotificationLevel::Error => {
                tracing::error!(category = ?self.category, "{}", self.message)
            }
        }
    }

    /// Vérifie si la notification est plus récente que N millisecondes
    pub fn is_recent(&self, max_age_ms: i64) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        now.saturating_sub(self.timestamp) < max_age_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_creation() {
        let notif = Notification::error(NotificationCategory::Midi, "Test error");

        assert_eq!(notif.level, NotificationLevel::Error);
        assert_eq!(notif.category, NotificationCategory::Midi);
        assert_eq!(notif.message, "Test error");
        assert!(notif.timestamp > 0);
    }

    #[test]
    fn test_notification_helpers() {
        let info = Notification::info(NotificationCategory::Audio, "Info");
        let warning = Notification::warning(NotificationCategory::Peer, "Warning");
        let error = Notification::error(NotificationCategory::Engine, "Error");

        assert_eq!(info.level, NotificationLevel::Info);
        assert_eq!(warning.level, NotificationLevel::Warning);
        assert_eq!(error.level, NotificationLevel::Error);
        error.log();
    }

    #[test]
    fn test_notification_is_recent() {
        let notif = Notification::info(NotificationCategory::Engine, "Test");
        assert!(notif.is_recent(10_000));
    }

    #[test]
    fn test_serialises_lowercase() {
        let notif = Notification::warning(NotificationCategory::Audio, "muted");
        let json = serde_json::to_value(&notif).unwrap();
        assert_eq!(json["level"], "warning");
        assert_eq!(json["category"], "audio");
    }
}
