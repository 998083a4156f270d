use std::collections::HashMap;

use serde_json::Value;
use tracing::trace;

use crate::error::{ChannelError, Result};
use crate::registry::ListenerId;
use crate::sender::ChannelSender;

/// Handler invoked for every value emitted under a topic it listens on.
pub type TopicHandler = Box<dyn Fn(&dyn ChannelSender, &Value)>;

/// In-process topic-keyed fan-out: the non-networked peer of
/// [`crate::SocketChannel`].
///
/// Delivery is synchronous and runs on the emitting thread. Handlers are
/// not isolated from one another: a panicking handler aborts delivery to
/// handlers registered after it.
pub struct LocalChannel {
    name: String,
    handlers_by_topic: HashMap<String, Vec<(ListenerId, TopicHandler)>>,
    started: bool,
}

impl LocalChannel {
    /// Create a channel that has not been started yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers_by_topic: HashMap::new(),
            started: false,
        }
    }

    /// The channel's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transition to started, exactly once.
    ///
    /// Synchronous: there is no readiness condition to await in-process.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(ChannelError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    /// Whether `start` has been called.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Register `handler` under `topic`. Multiple handlers per topic are
    /// permitted; all are invoked in registration order.
    pub fn listen(&mut self, topic: impl Into<String>, handler: TopicHandler) -> ListenerId {
        let id = ListenerId::next();
        self.handlers_by_topic
            .entry(topic.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove the registration `id` made under `topic`. A no-op (returning
    /// false) if it was never registered there.
    pub fn unlisten(&mut self, topic: &str, id: ListenerId) -> bool {
        let Some(handlers) = self.handlers_by_topic.get_mut(topic) else {
            return false;
        };
        match handlers.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(idx) => {
                handlers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Synchronously invoke every handler registered for `topic`, in
    /// registration order. An absent topic is a silent no-op.
    pub fn emit(&self, topic: &str, sender: &dyn ChannelSender, payload: &Value) {
        let Some(handlers) = self.handlers_by_topic.get(topic) else {
            return;
        };
        trace!(channel = %self.name, topic, handlers = handlers.len(), "emitting");
        for (_, handler) in handlers {
            handler(sender, payload);
        }
    }
}
