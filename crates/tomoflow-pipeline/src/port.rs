use std::sync::{Arc, OnceLock};

use crate::queue::Queue;

/// Receiving end of an edge: anything that can accept a typed item.
pub trait InputSide<T>: Send + Sync {
    /// Deliver one item. Returns `false` once the endpoint no longer
    /// accepts input (e.g. its queue was closed).
    fn input(&self, item: T) -> bool;
}

impl<T: Send> InputSide<T> for Queue<T> {
    fn input(&self, item: T) -> bool {
        self.push(item)
    }
}

/// One-way edge delivering items into a downstream stage's input queue.
pub struct Port<T> {
    next: Arc<dyn InputSide<T>>,
}

impl<T> Port<T> {
    pub fn new(next: Arc<dyn InputSide<T>>) -> Self {
        Self { next }
    }

    pub fn forward(&self, item: T) -> bool {
        self.next.input(item)
    }
}

/// Sending end owned by a stage. A port is attached exactly once while the
/// graph is built; forwarding without one is a wiring bug, not a runtime
/// condition.
pub struct OutputSide<T> {
    port: OnceLock<Port<T>>,
}

impl<T> Default for OutputSide<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OutputSide<T> {
    pub fn new() -> Self {
        Self {
            port: OnceLock::new(),
        }
    }

    /// # Panics
    ///
    /// Attaching twice is a programming error.
    pub fn attach(&self, port: Port<T>) {
        if self.port.set(port).is_err() {
            panic!("OutputSide: port already attached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.port.get().is_some()
    }

    /// Forward `item` through the attached port.
    ///
    /// # Panics
    ///
    /// Calling this with no port attached is a programming error.
    pub fn output(&self, item: T) -> bool {
        match self.port.get() {
            Some(port) => port.forward(item),
            None => panic!("OutputSide: missing port"),
        }
    }
}
