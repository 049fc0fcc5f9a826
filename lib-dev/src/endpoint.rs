// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Matthias Bilger <matthias@bilger.info>

use crate::transport::{DescriptorTree, Direction};

/// An endpoint together with the interface setting that exposes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub endpoint: u8,
    pub interface: u8,
    pub alternate: u8,
    pub configuration: u8,
}

/// Find the first endpoint with the given direction.
///
/// Walks configurations, interfaces, alternate settings and endpoints in the
/// order the device reports them and stops at the first match.
pub fn resolve_endpoint(tree: &DescriptorTree, direction: Direction) -> Option<ResolvedEndpoint> {
    for config in &tree.configurations {
        for interface in &config.interfaces {
            for alternate in &interface.alternates {
                if let Some(ep) = alternate.endpoints.iter().find(|ep| ep.direction == direction) {
                    return Some(ResolvedEndpoint {
                        endpoint: ep.number,
                        interface: interface.number,
                        alternate: alternate.setting,
                        configuration: config.value,
                    });
                }
            }
        }
    }
    None
}

/// First OUT endpoint of the tree. `None` means the device has no firmware.
pub fn resolve_out_endpoint(tree: &DescriptorTree) -> Option<ResolvedEndpoint> {
    resolve_endpoint(tree, Direction::Out)
}

/// First IN endpoint exposed by the same interface setting as `out`
pub fn resolve_in_endpoint(tree: &DescriptorTree, out: &ResolvedEndpoint) -> Option<u8> {
    tree.configurations
        .iter()
        .filter(|c| c.value == out.configuration)
        .flat_map(|c| c.interfaces.iter())
        .filter(|i| i.number == out.interface)
        .flat_map(|i| i.alternates.iter())
        .filter(|a| a.setting == out.alternate)
        .flat_map(|a| a.endpoints.iter())
        .find(|ep| ep.direction == Direction::In)
        .map(|ep| ep.number)
}

/// Number of endpoints across every configuration, interface and alternate
pub fn endpoint_count(tree: &DescriptorTree) -> usize {
    tree.configurations
        .iter()
        .flat_map(|c| c.interfaces.iter())
        .flat_map(|i| i.alternates.iter())
        .map(|a| a.endpoints.len())
        .sum()
}
