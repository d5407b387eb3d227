#![no_std]

// Map value layouts shared with the XDP filtering program.
// Keep this crate `no_std` so it stays usable from kernel-side code.

pub const MAP_CONFIG: &str = "config_map";
pub const MAP_PORTS: &str = "port_map";
pub const MAP_TX_PORTS: &str = "tx_port";
pub const MAP_COUNTERS: &str = "counters";
pub const MAP_EVENTS: &str = "event_ringbuf";
pub const XDP_PROGRAM: &str = "esdx_monitor";

pub const CONFIG_SLOT: u32 = 0;

/// Traffic position relative to the provider AS.
pub const UPSTREAM: u32 = 0;
pub const DOWNSTREAM: u32 = 1;

/// Per-CPU traffic totals for one hop.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Counter {
    pub bytes: u64,
    pub packets: u64,
}

/// Global filter configuration. Port bounds are stored in network byte order.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FilterConfig {
    pub role: u32,
    pub first_scion_port: u16,
    pub last_scion_port: u16,
}

/// Forwarding entry for an ingress interface.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PortEntry {
    pub direction: u32,
    pub forward_to: u32,
}

#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{Counter, FilterConfig, PortEntry};
    use aya::Pod;

    unsafe impl Pod for Counter {}
    unsafe impl Pod for FilterConfig {}
    unsafe impl Pod for PortEntry {}
}
