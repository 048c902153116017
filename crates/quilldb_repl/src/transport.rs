//! Transport abstraction over the framed message connection.

use crate::error::ReplResult;
use crate::message::Message;
use std::sync::mpsc::{self, Receiver, Sender};

/// Completion callback for a request.
///
/// Transports invoke this once, from any thread; implementations enqueue
/// the result onto their own mailbox rather than doing work inline.
pub type ResponseCallback = Box<dyn FnOnce(ReplResult<Message>) + Send>;

/// A full-duplex framed message connection.
///
/// The transport is thread-safe and message-ordered. Cancellation flushes
/// all pending callbacks with [`crate::ReplError::Cancelled`].
pub trait Transport: Send + Sync {
    /// Sends a request and arranges for `on_response` to be called with
    /// the reply.
    fn send_request(&self, message: Message, on_response: ResponseCallback) -> ReplResult<()>;

    /// Sends a message that expects no reply.
    fn send_no_reply(&self, message: Message) -> ReplResult<()>;

    /// Cancels all outstanding requests.
    fn cancel_pending(&self);

    /// Closes the connection.
    fn close(&self);
}

/// A reply handle for a peer-initiated request.
pub struct Responder {
    tx: Sender<Message>,
}

impl Responder {
    /// Creates a responder and the receiver its reply will arrive on.
    pub fn channel() -> (Self, Receiver<Message>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Sends the reply. Dropped receivers are ignored; the peer went away.
    pub fn respond(self, message: Message) {
        let _ = self.tx.send(message);
    }
}

/// A peer-initiated message, with a reply handle when the peer expects one.
pub struct Inbound {
    /// The message itself.
    pub message: Message,
    /// Reply handle, if the peer asked for a response.
    pub responder: Option<Responder>,
}

impl Inbound {
    /// Wraps a message that expects no reply.
    pub fn notification(message: Message) -> Self {
        Self {
            message,
            responder: None,
        }
    }

    /// Wraps a message with a reply channel.
    pub fn request(message: Message) -> (Self, Receiver<Message>) {
        let (responder, rx) = Responder::channel();
        (
            Self {
                message,
                responder: Some(responder),
            },
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Profile;

    #[test]
    fn responder_delivers_reply() {
        let (inbound, rx) = Inbound::request(Message::new(Profile::Changes));
        inbound.responder.unwrap().respond(Message::reply());
        assert_eq!(rx.recv().unwrap().profile(), Profile::Reply);
    }

    #[test]
    fn respond_after_receiver_drop_is_harmless() {
        let (responder, rx) = Responder::channel();
        drop(rx);
        responder.respond(Message::reply());
    }
}
