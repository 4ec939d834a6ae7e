//! Transport Events
//!
//! The fixed event vocabulary a transport emits for each task.

use bytes::Bytes;

use super::challenge::{Challenge, ChallengeReply};
use super::responder::Responder;
use super::types::{CachedResponse, Request, Response, ResponseDisposition, SendProgress};
use super::TaskHandle;
use crate::error::TransportError;

/// Event emitted by a transport for one task
#[derive(Debug)]
pub enum TaskEvent {
    /// Response headers arrived; the transport waits for a disposition
    ResponseReceived {
        response: Response,
        reply: Responder<ResponseDisposition>,
    },

    /// A chunk of the response body arrived
    DataReceived { chunk: Bytes },

    /// Part of the request body was sent
    SentBodyData(SendProgress),

    /// The transport needs a fresh copy of the request body
    NeedNewBodyStream { reply: Responder<Option<Bytes>> },

    /// The server redirected; reply with the request to follow, or `None` to stop
    WillRedirect {
        response: Response,
        request: Request,
        reply: Responder<Option<Request>>,
    },

    /// The transport proposes caching the response; reply `None` to suppress
    WillCacheResponse {
        proposed: CachedResponse,
        reply: Responder<Option<CachedResponse>>,
    },

    /// The task was converted into a download task with a new handle
    BecameDownload { download: TaskHandle },

    /// The server issued an authentication challenge for this task
    Challenge {
        challenge: Challenge,
        reply: Responder<ChallengeReply>,
    },

    /// The task finished; always the last event for a task
    Completed { error: Option<TransportError> },
}

impl TaskEvent {
    /// Event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResponseReceived { .. } => "response-received",
            Self::DataReceived { .. } => "data-received",
            Self::SentBodyData(_) => "sent-body-data",
            Self::NeedNewBodyStream { .. } => "need-new-body-stream",
            Self::WillRedirect { .. } => "will-redirect",
            Self::WillCacheResponse { .. } => "will-cache-response",
            Self::BecameDownload { .. } => "became-download",
            Self::Challenge { .. } => "challenge",
            Self::Completed { .. } => "completed",
        }
    }

    /// Whether this is the terminal event for its task
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = TaskEvent::DataReceived {
            chunk: Bytes::from_static(b"ab"),
        };
        assert_eq!(event.name(), "data-received");
        assert!(!event.is_terminal());

        let done = TaskEvent::Completed { error: None };
        assert_eq!(done.name(), "completed");
        assert!(done.is_terminal());
    }
}
