//! Device list diffing

use std::collections::HashMap;

use serde::Serialize;

use nw_core::types::DeviceRef;

/// A stored device paired with its replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceChange {
    pub previous: DeviceRef,
    pub current: DeviceRef,
}

/// Incoming device list compared to a group's stored list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceDelta {
    pub added: Vec<DeviceRef>,
    pub removed: Vec<DeviceRef>,
    /// Same MAC, new IP
    pub ip_changed: Vec<DeviceChange>,
    /// Same IP, new MAC
    pub mac_changed: Vec<DeviceChange>,
    pub unchanged: Vec<DeviceRef>,
}

impl DeviceDelta {
    /// Whether applying the incoming list changes membership
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty()
            && self.removed.is_empty()
            && self.ip_changed.is_empty()
            && self.mac_changed.is_empty())
    }

    /// Devices whose old rules must go
    pub fn outgoing(&self) -> impl Iterator<Item = &DeviceRef> {
        self.removed.iter().chain(
            self.ip_changed
                .iter()
                .chain(self.mac_changed.iter())
                .map(|change| &change.previous),
        )
    }

    /// Devices that need new rules
    pub fn incoming(&self) -> impl Iterator<Item = &DeviceRef> {
        self.added.iter().chain(
            self.ip_changed
                .iter()
                .chain(self.mac_changed.iter())
                .map(|change| &change.current),
        )
    }
}

fn mac_key(mac: &str) -> String {
    mac.trim().to_ascii_lowercase().replace('-', ":")
}

/// How an incoming device was paired with a stored one
#[derive(Clone, Copy)]
enum Pairing {
    ByMac(usize),
    ByIp(usize),
}

/// Take the first stored index in `candidates` not yet paired
fn claim(candidates: Option<&Vec<usize>>, paired: &mut [bool]) -> Option<usize> {
    let idx = candidates?.iter().copied().find(|idx| !paired[*idx])?;
    paired[idx] = true;
    Some(idx)
}

/// Diff `incoming` against `stored`.
///
/// Each stored device pairs with at most one incoming device. Every MAC match
/// is made before any IP match, so a device that kept its MAC is never claimed
/// by another device that reused its IP. Unpaired incoming devices are added,
/// unpaired stored devices are removed, so every device lands in exactly one
/// bucket.
pub fn compute_delta(stored: &[DeviceRef], incoming: &[DeviceRef]) -> DeviceDelta {
    let mut by_mac: HashMap<String, Vec<usize>> = HashMap::new();
    let mut by_ip: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, device) in stored.iter().enumerate() {
        by_mac.entry(mac_key(&device.mac)).or_default().push(idx);
        by_ip.entry(device.ip.as_str()).or_default().push(idx);
    }

    let mut paired = vec![false; stored.len()];
    let mut pairings: Vec<Option<Pairing>> = vec![None; incoming.len()];

    for (slot, device) in pairings.iter_mut().zip(incoming) {
        *slot = claim(by_mac.get(&mac_key(&device.mac)), &mut paired).map(Pairing::ByMac);
    }
    for (slot, device) in pairings.iter_mut().zip(incoming) {
        if slot.is_none() {
            *slot = claim(by_ip.get(device.ip.as_str()), &mut paired).map(Pairing::ByIp);
        }
    }

    let mut delta = DeviceDelta::default();
    for (pairing, device) in pairings.into_iter().zip(incoming) {
        let change = |idx: usize| DeviceChange {
            previous: stored[idx].clone(),
            current: device.clone(),
        };
        match pairing {
            Some(Pairing::ByMac(idx)) if stored[idx].ip == device.ip => {
                delta.unchanged.push(device.clone())
            }
            Some(Pairing::ByMac(idx)) => delta.ip_changed.push(change(idx)),
            Some(Pairing::ByIp(idx)) if mac_key(&stored[idx].mac) == mac_key(&device.mac) => {
                delta.unchanged.push(device.clone())
            }
            Some(Pairing::ByIp(idx)) => delta.mac_changed.push(change(idx)),
            None => delta.added.push(device.clone()),
        }
    }

    delta.removed = stored
        .iter()
        .zip(paired)
        .filter(|(_, was_paired)| !was_paired)
        .map(|(device, _)| device.clone())
        .collect();
    delta
}
