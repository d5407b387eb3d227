use std::{ffi::CString, io, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, ensure};
use aya::programs::XdpFlags;
use clap::ValueEnum;
use thiserror::Error;

use esdx_monitor_common::{DOWNSTREAM, UPSTREAM};

pub const DEFAULT_PORTS: &str = "30042:30051";
pub const DEFAULT_INTERVAL_SECS: u64 = 10;
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Position of the monitor relative to the provider AS.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Role {
    Upstream,
    Downstream,
}

impl Role {
    pub fn as_raw(self) -> u32 {
        match self {
            Role::Upstream => UPSTREAM,
            Role::Downstream => DOWNSTREAM,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    Skb,
    Driver,
    Hw,
}

impl From<XdpMode> for XdpFlags {
    fn from(mode: XdpMode) -> Self {
        match mode {
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Hw => XdpFlags::HW_MODE,
        }
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PortRangeError {
    #[error("invalid underlay port range '{0}', expected FIRST:LAST")]
    Format(String),
    #[error("invalid underlay port '{0}'")]
    Port(String),
    #[error("first underlay port {first} is above last port {last}")]
    Reversed { first: u16, last: u16 },
}

/// Closed interval of SCION underlay UDP ports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (first, last) = s
            .split_once(':')
            .or_else(|| s.split_once('-'))
            .ok_or_else(|| PortRangeError::Format(s.to_string()))?;
        let parse = |raw: &str| {
            raw.trim()
                .parse::<u16>()
                .map_err(|_| PortRangeError::Port(raw.trim().to_string()))
        };
        let (first, last) = (parse(first)?, parse(last)?);
        if first > last {
            return Err(PortRangeError::Reversed { first, last });
        }
        Ok(Self { first, last })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

impl Interface {
    pub fn lookup(name: &str) -> Result<Self> {
        let ifname = CString::new(name).with_context(|| format!("invalid interface name {name:?}"))?;
        let index = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
        if index == 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("interface not found: {name}"));
        }
        Ok(Self {
            name: name.to_string(),
            index,
        })
    }
}

pub struct MonitorOptions {
    pub role: Role,
    pub ports: PortRange,
    pub up: Interface,
    pub down: Interface,
    pub interval: Duration,
    pub bpf_object: PathBuf,
    pub xdp_mode: XdpMode,
}

impl MonitorOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.interval.is_zero(), "update interval must be greater than zero");
        ensure!(
            self.interval <= MAX_INTERVAL,
            "update interval must not exceed {} seconds",
            MAX_INTERVAL.as_secs()
        );
        ensure!(
            self.up.index != self.down.index,
            "up and down interface must differ (both are {})",
            self.up.name
        );
        ensure!(
            self.bpf_object.is_file(),
            "filter object not found at {}",
            self.bpf_object.display()
        );
        Ok(())
    }
}
