//! The message currently targeted by the composer's reply marker.

use threadsync_proto::message::MessageRef;

/// At most one active reply target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyContext {
    target: Option<MessageRef>,
}

impl ReplyContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the target.
    pub fn set(&mut self, target: MessageRef) {
        self.target = Some(target);
    }

    /// Clears the target.
    pub fn clear(&mut self) {
        self.target = None;
    }

    /// Current target.
    #[must_use]
    pub const fn target(&self) -> Option<&MessageRef> {
        self.target.as_ref()
    }

    /// Clears the target only if it is still `expected`.
    ///
    /// A send that completes after the user picked another target must not
    /// wipe the newer choice.
    pub fn clear_if(&mut self, expected: &MessageRef) -> bool {
        if self.target.as_ref() == Some(expected) {
            self.target = None;
            true
        } else {
            false
        }
    }
}
