//! Seams to the host application: cart, navigation, notifications and
//! diagnostics. The conversation core only signals these; it never owns them.

use serde::Serialize;

use crate::frame::SkipReason;
use crate::message::CartItem;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Success,
    Error,
    Info,
}

/// A call-to-action attached to a notice. Following it is always an explicit
/// user choice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NoticeAction {
    pub label: String,
    pub path: String,
}

impl NoticeAction {
    pub fn new(label: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
        }
    }

    pub fn follow(&self, navigator: &dyn Navigator) {
        navigator.navigate(&self.path);
    }
}

/// An out-of-band, dismissible notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub message: String,
    pub kind: NoticeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self::new(message, NoticeKind::Success)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, NoticeKind::Error)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message, NoticeKind::Info)
    }

    fn new(message: impl Into<String>, kind: NoticeKind) -> Self {
        Self {
            message: message.into(),
            kind,
            action: None,
        }
    }

    pub fn with_action(mut self, label: impl Into<String>, path: impl Into<String>) -> Self {
        self.action = Some(NoticeAction::new(label, path));
        self
    }
}

pub trait CartSink: Send + Sync {
    fn add(&self, item: &CartItem);
}

pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice);
}

/// Receives frames the pipeline dropped. Purely observational.
pub trait DiagnosticSink: Send + Sync {
    fn frame_skipped(&self, reason: &SkipReason);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&SkipReason) + Send + Sync,
{
    fn frame_skipped(&self, reason: &SkipReason) {
        self(reason)
    }
}
