//! # Identifiers, Locators and the Identity Store
//!
//! Core addressing types for the identifier/locator split:
//!
//! - [`Identifier`]: 64-bit immutable node name, fixed for the node lifetime
//! - [`Locator`]: 64-bit mutable reachability value (one per subnetwork the
//!   node is attached to)
//! - [`Address`]: a (locator, identifier) pair as carried on the wire
//! - [`IdentityStore`]: holds this node's identifier and its current locator
//!   set
//!
//! ## Locator lifecycle
//!
//! A node always holds at least one locator. The set is replaced wholesale on
//! a locator-change event: the store swaps an immutable snapshot
//! (`Arc<Vec<Locator>>`) so concurrent readers never observe a partially
//! updated set. The previous set is returned to the caller so the locator
//! update protocol can announce the change to active correspondents.

use std::sync::{Arc, RwLock};

/// Immutable 64-bit node name, independent of location.
/// Assigned once at startup and never changed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(pub u64);

/// Mutable 64-bit network-layer reachability value.
/// Each locator names one subnetwork the node can currently be reached on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator(pub u64);

/// A full node address: which subnetwork (locator) plus which node in it
/// (identifier). Both halves travel in every packet header.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub loc: Locator,
    pub id: Identifier,
}

impl Address {
    pub fn new(loc: Locator, id: Identifier) -> Self {
        Self { loc, id }
    }
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identifier({})", self.0)
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Locator({})", self.0)
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Identifier {
    fn from(v: u64) -> Self {
        Identifier(v)
    }
}

impl From<u64> for Locator {
    fn from(v: u64) -> Self {
        Locator(v)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({}-{})", self.loc, self.id)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.loc, self.id)
    }
}

/// Rejected locator-set replacement. The store keeps the previous set.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidLocatorError {
    #[error("a node must hold at least one locator")]
    EmptySet,
    #[error("locator 0 is reserved and cannot be assigned")]
    Reserved,
    #[error("duplicate locator {0} in replacement set")]
    Duplicate(Locator),
}

/// This node's immutable identifier and mutable locator set.
///
/// The dispatch loop is the only writer; any task may take a read snapshot.
#[derive(Debug)]
pub struct IdentityStore {
    identifier: Identifier,
    locators: RwLock<Arc<Vec<Locator>>>,
}

impl IdentityStore {
    /// Fails if the initial set is invalid: a node must always be reachable
    /// on at least one locator.
    pub fn new(identifier: Identifier, locators: Vec<Locator>) -> Result<Self, InvalidLocatorError> {
        validate_locator_set(&locators)?;
        Ok(Self {
            identifier,
            locators: RwLock::new(Arc::new(locators)),
        })
    }

    /// Constant for the node lifetime.
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    /// Atomic snapshot of the current locator set.
    pub fn locators(&self) -> Arc<Vec<Locator>> {
        self.locators
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replaces the locator set wholesale and returns the previous set.
    ///
    /// On error the previous set is retained untouched. The caller hands
    /// `(previous, new)` to the locator update protocol so active
    /// correspondents learn about the change.
    pub fn set_locators(&self, new: Vec<Locator>) -> Result<Arc<Vec<Locator>>, InvalidLocatorError> {
        validate_locator_set(&new)?;
        let mut guard = self
            .locators
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(std::mem::replace(&mut *guard, Arc::new(new)))
    }

    /// True if `loc` names one of the subnetworks this node is attached to.
    pub fn has_locator(&self, loc: Locator) -> bool {
        self.locators().contains(&loc)
    }

    /// All (locator, identifier) pairs this node answers to.
    pub fn addresses(&self) -> Vec<Address> {
        self.locators()
            .iter()
            .map(|&loc| Address::new(loc, self.identifier))
            .collect()
    }

    /// Preferred source address for locally originated packets.
    pub fn primary_address(&self) -> Address {
        let locs = self.locators();
        // Set is never empty once constructed.
        Address::new(locs[0], self.identifier)
    }

    pub fn is_my_address(&self, addr: &Address) -> bool {
        addr.id == self.identifier && self.has_locator(addr.loc)
    }
}

fn validate_locator_set(locators: &[Locator]) -> Result<(), InvalidLocatorError> {
    if locators.is_empty() {
        return Err(InvalidLocatorError::EmptySet);
    }
    if locators.contains(&Locator(0)) {
        return Err(InvalidLocatorError::Reserved);
    }
    for (i, loc) in locators.iter().enumerate() {
        if locators[..i].contains(loc) {
            return Err(InvalidLocatorError::Duplicate(*loc));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_is_constant() {
        let store = IdentityStore::new(Identifier(7), vec![Locator(1)]).unwrap();
        assert_eq!(store.identifier(), Identifier(7));
        store.set_locators(vec![Locator(9)]).unwrap();
        assert_eq!(store.identifier(), Identifier(7));
    }

    #[test]
    fn set_locators_returns_previous_set() {
        let store = IdentityStore::new(Identifier(1), vec![Locator(1), Locator(2)]).unwrap();
        let previous = store.set_locators(vec![Locator(3)]).unwrap();
        assert_eq!(*previous, vec![Locator(1), Locator(2)]);
        assert_eq!(*store.locators(), vec![Locator(3)]);
    }

    #[test]
    fn empty_replacement_rejected_and_previous_retained() {
        let store = IdentityStore::new(Identifier(1), vec![Locator(4)]).unwrap();
        assert_eq!(store.set_locators(vec![]), Err(InvalidLocatorError::EmptySet));
        assert_eq!(*store.locators(), vec![Locator(4)]);
    }

    #[test]
    fn malformed_locators_rejected() {
        assert!(matches!(
            IdentityStore::new(Identifier(1), vec![Locator(0)]),
            Err(InvalidLocatorError::Reserved)
        ));
        let store = IdentityStore::new(Identifier(1), vec![Locator(2)]).unwrap();
        assert_eq!(
            store.set_locators(vec![Locator(5), Locator(5)]),
            Err(InvalidLocatorError::Duplicate(Locator(5)))
        );
        assert_eq!(*store.locators(), vec![Locator(2)]);
    }

    #[test]
    fn address_matching() {
        let store = IdentityStore::new(Identifier(3), vec![Locator(1), Locator(2)]).unwrap();
        assert!(store.is_my_address(&Address::new(Locator(1), Identifier(3))));
        assert!(store.is_my_address(&Address::new(Locator(2), Identifier(3))));
        assert!(!store.is_my_address(&Address::new(Locator(3), Identifier(3))));
        assert!(!store.is_my_address(&Address::new(Locator(1), Identifier(4))));
        assert_eq!(store.addresses().len(), 2);
        assert_eq!(store.primary_address().id, Identifier(3));
    }
}
