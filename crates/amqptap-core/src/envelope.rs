//! Consumer-facing output of tap and subscribe workers.

use tokio::sync::mpsc;

use crate::broker::TappedMessage;
use crate::error::TapError;

/// One item on a worker's output stream: a message or an error, never both.
#[derive(Debug)]
pub enum Envelope {
    Delivered(TappedMessage),
    Failed(TapError),
}

impl Envelope {
    pub fn message(&self) -> Option<&TappedMessage> {
        match self {
            Envelope::Delivered(message) => Some(message),
            Envelope::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TapError> {
        match self {
            Envelope::Delivered(_) => None,
            Envelope::Failed(error) => Some(error),
        }
    }
}

/// Shared output stream workers push envelopes onto.
pub type EnvelopeSender = mpsc::Sender<Envelope>;
