use std::collections::HashMap;
use std::net::SocketAddr;

use crate::net::Envelope;

/// An accepted application envelope as seen by a handler.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub from: SocketAddr,
    /// Display name of the sender, or its address before it joined.
    pub sender: &'a str,
    pub envelope: &'a Envelope,
}

impl Delivery<'_> {
    pub fn kind(&self) -> &str {
        self.envelope.kind.as_str()
    }

    pub fn payload(&self) -> &str {
        &self.envelope.payload
    }
}

pub trait MessageHandler: Send {
    fn handle(&mut self, delivery: &Delivery<'_>);
}

impl<F> MessageHandler for F
where
    F: FnMut(&Delivery<'_>) + Send,
{
    fn handle(&mut self, delivery: &Delivery<'_>) {
        self(delivery)
    }
}

/// Handlers keyed by application kind. Runs on the tick thread only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `kind`, returning whichever handler it replaced.
    pub fn register<F>(
        &mut self,
        kind: impl Into<String>,
        handler: F,
    ) -> Option<Box<dyn MessageHandler>>
    where
        F: FnMut(&Delivery<'_>) + Send + 'static,
    {
        self.register_boxed(kind, Box::new(handler))
    }

    pub fn register_boxed(
        &mut self,
        kind: impl Into<String>,
        handler: Box<dyn MessageHandler>,
    ) -> Option<Box<dyn MessageHandler>> {
        self.handlers.insert(kind.into(), handler)
    }

    pub fn unregister(&mut self, kind: &str) -> Option<Box<dyn MessageHandler>> {
        self.handlers.remove(kind)
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Returns `false` if nothing is registered for the delivery's kind.
    pub fn dispatch(&mut self, delivery: &Delivery<'_>) -> bool {
        match self.handlers.get_mut(delivery.kind()) {
            Some(handler) => {
                handler.handle(delivery);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
