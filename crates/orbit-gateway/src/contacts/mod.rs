//! Contact reconciliation.
//!
//! The library reports who the operator talks to through several channels,
//! none complete on its own: the recent-activity push, incremental updates,
//! the bulk history payload, the per-conversation listing and live messages.
//! Every channel is reduced to [`ContactSighting`]s and folded into the
//! [`ContactDirectory`] through the single [`merge`] primitive.
//!
//! `merge` is a join over each name field: an absent name never replaces a
//! present one, and when two present names disagree the smaller one (by byte
//! order) is kept. Applying sightings is therefore idempotent, monotonic and
//! independent of arrival order.

use std::collections::BTreeMap;

use orbit_gateway_protocol::ContactEntry;
use tracing::debug;

use crate::adapter::{ChatInfo, ContactInfo};
use crate::address::{Address, AddressKind};

pub mod debounce;

pub use debounce::Debouncer;

// ============================================================================
// Types
// ============================================================================

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub address: Address,
    /// Canonical name (address book or verified name).
    pub name: Option<String>,
    /// Self-chosen display name.
    pub alternate_name: Option<String>,
}

impl Contact {
    pub fn stub(address: Address) -> Self {
        Self {
            address,
            name: None,
            alternate_name: None,
        }
    }

    pub fn is_stub(&self) -> bool {
        self.name.is_none() && self.alternate_name.is_none()
    }

    pub fn to_entry(&self) -> Option<ContactEntry> {
        Some(ContactEntry {
            address: self.address.to_string(),
            name: self.name.clone(),
            alternate_name: self.alternate_name.clone(),
            kind: self.address.exposed_kind()?,
        })
    }
}

/// Partial identity data from one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactSighting {
    pub address: Address,
    pub name: Option<String>,
    pub alternate_name: Option<String>,
}

impl ContactSighting {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            name: None,
            alternate_name: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: Option<&str>) -> Self {
        self.name = clean_name(name);
        self
    }

    #[must_use]
    pub fn with_alternate_name(mut self, name: Option<&str>) -> Self {
        self.alternate_name = clean_name(name);
        self
    }

    /// From a library contact record. Unparseable ids yield `None`.
    pub fn from_contact_info(info: &ContactInfo) -> Option<Self> {
        let address = parse_or_skip(&info.id)?;
        let name = info.name.as_deref().or(info.verified_name.as_deref());
        Some(
            Self::new(address)
                .with_name(name)
                .with_alternate_name(info.notify.as_deref()),
        )
    }

    /// From a conversation listing. A 1:1 chat's name is the saved name.
    pub fn from_chat(chat: &ChatInfo) -> Option<Self> {
        let address = parse_or_skip(&chat.id)?;
        Some(Self::new(address).with_name(chat.name.as_deref()))
    }
}

fn clean_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

fn parse_or_skip(raw: &str) -> Option<Address> {
    match Address::parse(raw) {
        Ok(address) => Some(address),
        Err(e) => {
            debug!(address = raw, error = %e, "Skipping unparseable contact address");
            None
        }
    }
}

// ============================================================================
// Merge
// ============================================================================

/// What a merge did to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Unchanged,
    Added,
    Upgraded,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, MergeOutcome::Unchanged)
    }
}

/// Fold a sighting into an existing entry. Returns `true` if anything changed.
pub fn merge(existing: &mut Contact, incoming: &ContactSighting) -> bool {
    let name = merge_field(&mut existing.name, incoming.name.as_deref());
    let alternate = merge_field(&mut existing.alternate_name, incoming.alternate_name.as_deref());
    name || alternate
}

/// Join one name field. This is not first-wins: an absent name never
/// replaces a present one, and between two present names the byte-smaller
/// one stays, whichever arrived first.
fn merge_field(slot: &mut Option<String>, incoming: Option<&str>) -> bool {
    let Some(incoming) = incoming else {
        return false;
    };
    match slot {
        None => {
            *slot = Some(incoming.to_string());
            true
        }
        Some(current) if incoming < current.as_str() => {
            *current = incoming.to_string();
            true
        }
        Some(_) => false,
    }
}

// ============================================================================
// Directory
// ============================================================================

/// Canonical contact directory for the paired account.
#[derive(Debug, Default)]
pub struct ContactDirectory {
    contacts: BTreeMap<Address, Contact>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one sighting. Pseudo-addresses are ignored.
    pub fn merge(&mut self, sighting: &ContactSighting) -> MergeOutcome {
        if sighting.address.is_pseudo() {
            return MergeOutcome::Unchanged;
        }

        match self.contacts.get_mut(&sighting.address) {
            Some(existing) => {
                if merge(existing, sighting) {
                    MergeOutcome::Upgraded
                } else {
                    MergeOutcome::Unchanged
                }
            }
            None => {
                let mut contact = Contact::stub(sighting.address.clone());
                merge(&mut contact, sighting);
                self.contacts.insert(sighting.address.clone(), contact);
                MergeOutcome::Added
            }
        }
    }

    /// Merge a batch. Returns how many sightings changed what a snapshot
    /// shows; group entries are stored but never counted.
    pub fn merge_all<'a>(&mut self, sightings: impl IntoIterator<Item = &'a ContactSighting>) -> usize {
        sightings
            .into_iter()
            .filter(|s| self.merge(s).changed() && s.address.exposed_kind().is_some())
            .count()
    }

    pub fn get(&self, address: &Address) -> Option<&Contact> {
        self.contacts.get(address)
    }

    /// Every stored entry, groups included.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Entries visible to the orchestrator.
    pub fn exposed_count(&self) -> usize {
        self.contacts
            .keys()
            .filter(|a| a.exposed_kind().is_some())
            .count()
    }

    pub fn group_count(&self) -> usize {
        self.contacts
            .keys()
            .filter(|a| a.kind() == AddressKind::Group)
            .count()
    }

    /// Full snapshot of individual and linked-identity entries, ordered by
    /// address.
    pub fn snapshot(&self) -> Vec<ContactEntry> {
        self.contacts.values().filter_map(Contact::to_entry).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
