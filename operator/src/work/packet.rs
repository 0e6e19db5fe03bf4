//! The mutable context a fiber threads through its step chain.

use crate::presence::DomainPresenceInfo;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A typed, keyed bag of contextual values shared by all steps of one
/// fiber. Values are keyed by their Rust type; modules define small
/// newtypes for the entries they own. A packet references exactly one
/// [`DomainPresenceInfo`] and is never shared between fibers.
pub struct Packet {
    info: Arc<DomainPresenceInfo>,
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Packet {
    pub fn new(info: Arc<DomainPresenceInfo>) -> Self {
        Self {
            info,
            values: HashMap::new(),
        }
    }

    pub fn info(&self) -> &Arc<DomainPresenceInfo> {
        &self.info
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast().ok())
            .map(|b| *b)
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn values_round_trip_by_type() {
        let info = Arc::new(DomainPresenceInfo::new("ns", "uid1"));
        let mut packet = Packet::new(info);

        assert!(!packet.contains::<Marker>());
        packet.insert(Marker(7));
        assert_eq!(packet.get::<Marker>(), Some(&Marker(7)));

        packet.get_mut::<Marker>().unwrap().0 = 9;
        assert_eq!(packet.remove::<Marker>(), Some(Marker(9)));
        assert!(!packet.contains::<Marker>());
    }
}
