use anyhow::{Context, Result};
use aya::maps::{Array, DevMap, MapData, PerCpuHashMap, RingBuf};
use aya::programs::{Xdp, XdpFlags, xdp::XdpLinkId};
use aya::{Ebpf, EbpfLoader};

use esdx_monitor_common::{
    CONFIG_SLOT, Counter, DOWNSTREAM, FilterConfig, MAP_CONFIG, MAP_COUNTERS, MAP_EVENTS,
    MAP_PORTS, MAP_TX_PORTS, PortEntry, UPSTREAM, XDP_PROGRAM,
};

use crate::{
    config::{Interface, MonitorOptions, PortRange, Role},
    counters::PerCpuCounterTable,
};

/// The loaded filtering program, attached to both monitor interfaces.
pub struct AttachedFilter {
    bpf: Ebpf,
    links: Vec<(String, XdpLinkId)>,
}

impl AttachedFilter {
    pub fn load(opts: &MonitorOptions) -> Result<Self> {
        let mut bpf = EbpfLoader::new()
            .load_file(&opts.bpf_object)
            .with_context(|| format!("failed to load {}", opts.bpf_object.display()))?;

        init_static_tables(&mut bpf, opts)?;

        let program: &mut Xdp = bpf
            .program_mut(XDP_PROGRAM)
            .with_context(|| format!("program {XDP_PROGRAM} not found"))?
            .try_into()
            .context("xdp program has wrong type")?;
        program.load().context("failed to load xdp program")?;

        let flags = XdpFlags::from(opts.xdp_mode);
        let mut links = Vec::with_capacity(2);
        for iface in [&opts.up, &opts.down] {
            let link = program
                .attach(&iface.name, flags)
                .with_context(|| format!("attaching program to interface {} failed", iface.name))?;
            tracing::info!(iface = %iface.name, "monitor attached");
            links.push((iface.name.clone(), link));
        }

        Ok(Self { bpf, links })
    }

    pub fn counters(&mut self) -> Result<PerCpuCounterTable<MapData>> {
        let map = self
            .bpf
            .take_map(MAP_COUNTERS)
            .with_context(|| format!("map {MAP_COUNTERS} not found"))?;
        let map = PerCpuHashMap::<_, u32, Counter>::try_from(map)
            .context("counters map has unexpected type")?;
        Ok(PerCpuCounterTable::new(map))
    }

    pub fn events(&mut self) -> Result<RingBuf<MapData>> {
        let map = self
            .bpf
            .take_map(MAP_EVENTS)
            .with_context(|| format!("map {MAP_EVENTS} not found"))?;
        RingBuf::try_from(map).context("cannot open ring buffer")
    }

    /// Detaches from all interfaces in reverse attach order. Failures are logged.
    pub fn detach(mut self) {
        let Some(program) = self.bpf.program_mut(XDP_PROGRAM) else {
            tracing::warn!("program {XDP_PROGRAM} not found, skipping detach");
            return;
        };
        let program: &mut Xdp = match program.try_into() {
            Ok(program) => program,
            Err(err) => {
                tracing::warn!(error = %err, "xdp program has wrong type, skipping detach");
                return;
            }
        };
        while let Some((iface, link)) = self.links.pop() {
            match program.detach(link) {
                Ok(()) => tracing::info!(iface = %iface, "monitor detached"),
                Err(err) => {
                    tracing::warn!(iface = %iface, error = %err, "detaching program failed")
                }
            }
        }
    }
}

pub fn filter_config(role: Role, ports: PortRange) -> FilterConfig {
    FilterConfig {
        role: role.as_raw(),
        first_scion_port: ports.first.to_be(),
        last_scion_port: ports.last.to_be(),
    }
}

/// Traffic entering on the provider side flows downstream and vice versa.
pub fn port_entries(up: &Interface, down: &Interface) -> [(u32, PortEntry); 2] {
    [
        (
            up.index,
            PortEntry {
                direction: DOWNSTREAM,
                forward_to: down.index,
            },
        ),
        (
            down.index,
            PortEntry {
                direction: UPSTREAM,
                forward_to: up.index,
            },
        ),
    ]
}

/// Fills `config_map`, `port_map` and `tx_port`. A missing map is an error,
/// a rejected write is only logged.
fn init_static_tables(bpf: &mut Ebpf, opts: &MonitorOptions) -> Result<()> {
    {
        let map = bpf
            .map_mut(MAP_CONFIG)
            .with_context(|| format!("map {MAP_CONFIG} not found"))?;
        let mut config =
            Array::<_, FilterConfig>::try_from(map).context("config map has unexpected type")?;
        if let Err(err) = config.set(CONFIG_SLOT, filter_config(opts.role, opts.ports), 0) {
            tracing::warn!(map = MAP_CONFIG, error = %err, "update of map failed");
        }
    }

    {
        let map = bpf
            .map_mut(MAP_PORTS)
            .with_context(|| format!("map {MAP_PORTS} not found"))?;
        let mut ports =
            Array::<_, PortEntry>::try_from(map).context("port map has unexpected type")?;
        for (ifindex, entry) in port_entries(&opts.up, &opts.down) {
            if let Err(err) = ports.set(ifindex, entry, 0) {
                tracing::warn!(map = MAP_PORTS, ifindex, error = %err, "update of map failed");
            }
        }
    }

    let map = bpf
        .map_mut(MAP_TX_PORTS)
        .with_context(|| format!("map {MAP_TX_PORTS} not found"))?;
    let mut tx_ports = DevMap::try_from(map).context("tx port map has unexpected type")?;
    for iface in [&opts.up, &opts.down] {
        if let Err(err) = tx_ports.set(iface.index, iface.index, None, 0) {
            tracing::warn!(map = MAP_TX_PORTS, ifindex = iface.index, error = %err, "update of map failed");
        }
    }

    Ok(())
}
