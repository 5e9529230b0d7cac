use agent_provider::{Message, Role};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ContextWindowError;

/// One user request and every assistant/tool message produced while servicing it.
///
/// Messages are only ever appended. Once [`Turn::close`] runs the turn is
/// immutable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub started_at: String,
    pub request: Message,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activity: Vec<Message>,
    #[serde(default)]
    pub closed: bool,
}

impl Turn {
    pub fn new(request: Message) -> Result<Self, ContextWindowError> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            started_at: now_rfc3339()?,
            request,
            activity: Vec::new(),
            closed: false,
        })
    }

    /// Starts a turn from plain user text.
    pub fn user(text: impl Into<String>) -> Result<Self, ContextWindowError> {
        Self::new(Message::user(text))
    }

    pub fn push(&mut self, message: Message) -> Result<(), ContextWindowError> {
        if self.closed {
            return Err(ContextWindowError::TurnClosed {
                turn_id: self.id.clone(),
            });
        }
        self.activity.push(message);
        Ok(())
    }

    /// Marks the turn complete; closed turns accept no more messages.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Request followed by activity, in append order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        std::iter::once(&self.request).chain(self.activity.iter())
    }

    /// Approximate size used for budget accounting.
    pub fn estimated_bytes(&self) -> usize {
        self.messages().map(Message::estimated_bytes).sum()
    }

    /// Text of the last assistant message, if any.
    pub fn final_text(&self) -> Option<&str> {
        self.activity
            .iter()
            .rev()
            .find(|message| message.role == Role::Assistant && !message.content.trim().is_empty())
            .map(|message| message.content.as_str())
    }
}

pub(crate) fn now_rfc3339() -> Result<String, ContextWindowError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(ContextWindowError::ClockFormat)
}
