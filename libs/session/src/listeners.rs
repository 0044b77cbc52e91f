use std::fmt;
use std::sync::Arc;

use hdc_core::{Disconnected, Message, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&SessionError) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(&Disconnected) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Message,
    Error,
    Disconnect,
}

#[derive(Clone)]
pub enum Listener {
    Message(MessageHandler),
    Error(ErrorHandler),
    Disconnect(DisconnectHandler),
}

impl Listener {
    pub fn kind(&self) -> ListenerKind {
        match self {
            Listener::Message(_) => ListenerKind::Message,
            Listener::Error(_) => ListenerKind::Error,
            Listener::Disconnect(_) => ListenerKind::Disconnect,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener::{:?}", self.kind())
    }
}

/// Registered handlers, invoked in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Vec<(ListenerId, Listener)>,
}

impl ListenerRegistry {
    pub fn add(&mut self, id: ListenerId, listener: Listener) {
        self.entries.push((id, listener));
    }

    pub fn remove(&mut self, id: ListenerId) -> Option<ListenerKind> {
        let index = self.entries.iter().position(|(entry, _)| *entry == id)?;
        Some(self.entries.remove(index).1.kind())
    }

    /// Removes every listener of `kind`, returning how many were dropped.
    pub fn remove_kind(&mut self, kind: ListenerKind) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(_, listener)| listener.kind() != kind);
        before - self.entries.len()
    }

    pub fn count(&self, kind: ListenerKind) -> usize {
        self.entries
            .iter()
            .filter(|(_, listener)| listener.kind() == kind)
            .count()
    }

    pub fn dispatch_message(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for (_, listener) in &self.entries {
            if let Listener::Message(handler) = listener {
                handler(message);
                delivered += 1;
            }
        }
        delivered
    }

    /// Returns `false` when no error listener was registered.
    pub fn emit_error(&self, error: &SessionError) -> bool {
        let mut handled = false;
        for (_, listener) in &self.entries {
            if let Listener::Error(handler) = listener {
                handler(error);
                handled = true;
            }
        }
        handled
    }

    pub fn emit_disconnect(&self, disconnected: &Disconnected) -> bool {
        let mut handled = false;
        for (_, listener) in &self.entries {
            if let Listener::Disconnect(handler) = listener {
                handler(disconnected);
                handled = true;
            }
        }
        handled
    }
}
