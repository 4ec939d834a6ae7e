//! Enforce-once reply channels
//!
//! Several transport events carry a completion the transport waits on. A
//! [`Responder`] wraps that completion: `respond` consumes it, so a second
//! reply does not compile, and dropping it unanswered delivers a fallback
//! value instead of leaving the transport waiting forever.

use log::error;
use tokio::sync::oneshot;

type Reply<T> = Box<dyn FnOnce(T) + Send>;

/// Single-use reply to a transport event
pub struct Responder<T: Send + 'static> {
    event: &'static str,
    reply: Option<Reply<T>>,
    fallback: Option<T>,
}

impl<T: Send + 'static> Responder<T> {
    /// Wrap a reply callback; `fallback` is delivered if the responder is dropped unanswered
    pub fn new(event: &'static str, fallback: T, reply: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            event,
            reply: Some(Box::new(reply)),
            fallback: Some(fallback),
        }
    }

    /// Responder whose reply is received on a oneshot channel
    pub fn channel(event: &'static str, fallback: T) -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self::new(event, fallback, move |value| {
            let _ = tx.send(value);
        });
        (responder, rx)
    }

    /// Name of the event this responder answers
    pub fn event(&self) -> &'static str {
        self.event
    }

    /// Deliver the reply
    pub fn respond(mut self, value: T) {
        if let Some(reply) = self.reply.take() {
            reply(value);
        }
    }
}

impl<T: Send + 'static> Drop for Responder<T> {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            error!(
                "Reply for {} was dropped without being answered; delivering fallback",
                self.event
            );
            if let Some(fallback) = self.fallback.take() {
                reply(fallback);
            }
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("event", &self.event)
            .field("answered", &self.reply.is_none())
            .finish()
    }
}

/// The externally supplied "all background events drained" callback.
///
/// Move-only: whoever holds it last is the one that calls it, and a token
/// that is dropped still runs the callback.
#[derive(Debug)]
pub struct BackgroundCompletion(Responder<()>);

impl BackgroundCompletion {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self(Responder::new("background-events-finished", (), move |()| {
            callback()
        }))
    }

    /// Run the callback
    pub fn complete(self) {
        self.0.respond(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_respond_delivers_value() {
        let (responder, mut rx) = Responder::channel("response", 0u8);
        responder.respond(7);
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_drop_delivers_fallback() {
        let (responder, mut rx) = Responder::channel("redirect", Some("fallback"));
        drop(responder);
        assert_eq!(rx.try_recv().unwrap(), Some("fallback"));
    }

    #[test]
    fn test_background_completion_runs_once_when_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let completion = BackgroundCompletion::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(completion);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&calls);
        let completion = BackgroundCompletion::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        completion.complete();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
