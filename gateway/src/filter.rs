//! Ordered advertisement predicates.
//!
//! Grounded on the filter classes in `BLE_Client.py` (`BLE_Filter_RSSI`,
//! `BLE_Filter_White_List`, `BLE_Filter_Connectable`, `BLE_Filter_Starts_With`,
//! `BLE_Filter_Mfg_Id`): each filter kind there is a small class with a single
//! `filter(entry) -> bool` method, applied in the order filters were added.
//! Recast here as a closed enum (no base-class hierarchy needed) evaluated
//! by [`FilterChain::accept`].

use crate::ad::AdvertisementRecord;
use crate::Address;
use std::collections::HashSet;

/// A single advertisement predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Accepts only advertisements with RSSI at or above the threshold.
    Rssi(i16),
    /// Accepts only advertisements reported as connectable.
    Connectable(bool),
    /// Accepts only advertisements from one of these addresses.
    Whitelist(HashSet<Address>),
    /// Accepts only advertisements whose local name starts with the prefix.
    NamePrefix(String),
    /// Accepts only advertisements carrying this manufacturer ID.
    MfgIdEq(u16),
}

impl Filter {
    fn accepts(&self, ad: &AdvertisementRecord, rssi: Option<i16>, connectable: bool, address: Address) -> bool {
        match self {
            Filter::Rssi(min) => rssi.map(|r| r >= *min).unwrap_or(false),
            Filter::Connectable(want) => connectable == *want,
            Filter::Whitelist(set) => set.contains(&address),
            Filter::NamePrefix(prefix) => ad.local_name.as_deref().is_some_and(|n| n.starts_with(prefix.as_str())),
            Filter::MfgIdEq(id) => ad.manufacturer_id == Some(*id),
        }
    }
}

/// An ordered, short-circuiting AND of [`Filter`]s.
///
/// An empty chain accepts everything. When the chain contains an
/// [`Filter::Rssi`] filter, [`FilterChain::reconsider`] lets the [`crate::scanner::Scanner`]
/// retroactively admit a device that was previously rejected purely for RSSI
/// once a later frame clears the threshold, matching
/// `BLE_Device_Delegate.handleDiscovery`'s re-evaluation of RSSI-rejected
/// devices on every subsequent advertisement.
#[derive(Clone, Debug, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    /// An empty chain; accepts every advertisement.
    pub fn new() -> Self {
        Self { filters: Vec::new() }
    }

    /// Replaces the chain's contents, in the given order.
    pub fn set(&mut self, filters: Vec<Filter>) {
        self.filters = filters;
    }

    /// Appends one filter to the end of the chain.
    pub fn push(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    /// Returns `true` if every filter in the chain accepts the advertisement.
    pub fn accept(&self, ad: &AdvertisementRecord, rssi: Option<i16>, connectable: bool, address: Address) -> bool {
        self.filters.iter().all(|f| f.accepts(ad, rssi, connectable, address))
    }

    /// Returns `true` if the chain would accept the advertisement once the
    /// RSSI filters are ignored — i.e. every non-RSSI filter passes. Used to
    /// decide whether a device rejected only for RSSI is eligible for
    /// retroactive admission when its RSSI later improves.
    pub fn accepts_ignoring_rssi(&self, ad: &AdvertisementRecord, connectable: bool, address: Address) -> bool {
        self.filters.iter().all(|f| matches!(f, Filter::Rssi(_)) || f.accepts(ad, None, connectable, address))
    }

    /// Whether the chain contains at least one RSSI filter.
    pub fn has_rssi_filter(&self) -> bool {
        self.filters.iter().any(|f| matches!(f, Filter::Rssi(_)))
    }

    /// Number of filters currently in the chain.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the chain has no filters.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_ad() -> AdvertisementRecord {
        AdvertisementRecord {
            local_name: None,
            flags: None,
            service_uuids: Vec::new(),
            service_data: Default::default(),
            manufacturer_id: None,
            manufacturer_data: Vec::new(),
            kind: crate::ad::BeaconKind::Standard,
        }
    }

    #[test]
    fn empty_chain_accepts_everything() {
        let chain = FilterChain::new();
        assert!(chain.accept(&blank_ad(), None, false, Address::any()));
    }

    #[test]
    fn rssi_filter_rejects_below_threshold_and_accepts_at_or_above() {
        let mut chain = FilterChain::new();
        chain.push(Filter::Rssi(-70));
        assert!(!chain.accept(&blank_ad(), Some(-80), true, Address::any()));
        assert!(chain.accept(&blank_ad(), Some(-70), true, Address::any()));
        assert!(chain.accept(&blank_ad(), Some(-50), true, Address::any()));
    }

    #[test]
    fn name_prefix_filter_matches_start_of_name() {
        let mut chain = FilterChain::new();
        chain.push(Filter::NamePrefix("Ruuvi".into()));
        let mut ad = blank_ad();
        ad.local_name = Some("RuuviTag 1234".into());
        assert!(chain.accept(&ad, None, false, Address::any()));
        ad.local_name = Some("Other".into());
        assert!(!chain.accept(&ad, None, false, Address::any()));
    }

    #[test]
    fn rejected_purely_on_rssi_is_eligible_for_retroactive_admission() {
        let mut chain = FilterChain::new();
        chain.push(Filter::Rssi(-60));
        chain.push(Filter::Connectable(true));
        let ad = blank_ad();
        assert!(!chain.accept(&ad, Some(-80), true, Address::any()));
        assert!(chain.accepts_ignoring_rssi(&ad, true, Address::any()));
        assert!(!chain.accepts_ignoring_rssi(&ad, false, Address::any()));
    }
}
