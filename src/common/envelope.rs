//! Metadata envelope
//!
//! A typed attribute bag attached to every `Conn`. Transports stash
//! context here (virtual interface config, SSH handles, forward requests)
//! and downstream components query it by type instead of downcasting
//! streams or reaching for globals.

use std::any::{Any, TypeId};
use std::collections::HashMap;

#[derive(Default)]
pub struct Envelope {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    /// Take a value out of the envelope.
    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope({} entries)", self.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn insert_get_remove() {
        let mut env = Envelope::new();
        assert!(env.get::<Marker>().is_none());

        env.insert(Marker(7));
        assert_eq!(env.get::<Marker>(), Some(&Marker(7)));

        env.insert(Marker(8));
        assert_eq!(env.remove::<Marker>(), Some(Marker(8)));
        assert!(!env.contains::<Marker>());
    }
}
