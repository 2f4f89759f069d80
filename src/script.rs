//! Ordered expect/send steps executed against one connection.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::protocol::{BackendMessage, FrontendMessage, ServerCodec};
use crate::session::SessionError;

/// One step of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Read the next client frame and check it against the pattern.
    Expect(FrontendMessage),
    /// Write a frame to the client.
    Send(BackendMessage),
}

/// A sequence of steps, executed in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<Step>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn expect(&mut self, message: FrontendMessage) {
        self.push(Step::Expect(message));
    }

    pub fn send(&mut self, message: BackendMessage) {
        self.push(Step::Send(message));
    }

    /// Inserts `steps` ahead of every step already in the script.
    pub fn prepend(&mut self, steps: impl IntoIterator<Item = Step>) {
        let tail = std::mem::take(&mut self.steps);
        self.steps.extend(steps);
        self.steps.extend(tail);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step against `framed`, stopping at the first failure.
    ///
    /// Sent frames are buffered and flushed before each expectation, so a
    /// reply is delivered as one write.
    pub async fn run<S>(&self, framed: &mut Framed<S, ServerCodec>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for (step, item) in self.steps.iter().enumerate() {
            match item {
                Step::Send(message) => {
                    debug!(step, kind = message.kind(), "send");
                    framed.feed(message).await?;
                }
                Step::Expect(expected) => {
                    framed.flush().await?;
                    let actual = match framed.next().await {
                        Some(message) => message?,
                        None => {
                            return Err(SessionError::UnexpectedEof {
                                step,
                                expected: Box::new(expected.clone()),
                            });
                        }
                    };
                    debug!(step, %actual, "received");
                    if !expected.matches(&actual) {
                        return Err(SessionError::Mismatch {
                            step,
                            expected: Box::new(expected.clone()),
                            actual: Box::new(actual),
                        });
                    }
                }
            }
        }

        framed.flush().await?;
        match framed.read_buffer().len() {
            0 => Ok(()),
            trailing => Err(SessionError::TrailingData(trailing)),
        }
    }
}
