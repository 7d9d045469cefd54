//! User-facing notices.
//!
//! The client never renders anything itself; it hands [`Notice`]s to a
//! [`Notifier`] supplied by the embedding application.

use strum_macros::Display;

use crate::error::ApiError;
use crate::error::Presentation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
    pub suggested_actions: Vec<String>,
}

impl Notice {
    pub fn from_api_error(err: &ApiError) -> Self {
        let (level, title) = match err.presentation() {
            Presentation::Transient => (NoticeLevel::Warning, "Temporary problem"),
            Presentation::ActionRequired => (NoticeLevel::Error, "Action required"),
            Presentation::TemporarilyUnavailable => {
                (NoticeLevel::Warning, "Service temporarily unavailable")
            }
        };
        Self {
            level,
            title: title.to_string(),
            message: format!("{} (error id {})", err.message, err.error_id),
            suggested_actions: err.suggested_actions.clone(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Default sink: writes notices to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        let actions = notice.suggested_actions.join("; ");
        match notice.level {
            NoticeLevel::Info => {
                tracing::info!(title = %notice.title, actions, "{}", notice.message)
            }
            NoticeLevel::Warning => {
                tracing::warn!(title = %notice.title, actions, "{}", notice.message)
            }
            NoticeLevel::Error => {
                tracing::error!(title = %notice.title, actions, "{}", notice.message)
            }
        }
    }
}
