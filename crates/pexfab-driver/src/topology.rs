// SPDX-License-Identifier: AGPL-3.0-only

//! Topology construction
//!
//! Devices live in an arena owned by [`Topology`]; links between them are
//! plain indices. Construction runs in three passes:
//!
//! 1. **Resolve** every leaf: the port whose secondary bus is the leaf's bus
//!    governs it; that port's siblings (same primary bus) form one device.
//!    The device's upstream port is the port whose secondary bus is the
//!    siblings' primary bus. The upstream port's own bus is resolved first,
//!    so parents always exist before their children. No upstream port means
//!    the siblings are the root device.
//! 2. **Connect** each downstream port to the child device or leaf below
//!    it, checking subordinate bus ranges.
//! 3. **Depth** is assigned top-down from every root.

use crate::access::RegisterAccess;
use crate::address::PciAddress;
use crate::device::{BridgeDevice, Child};
use crate::error::{PexError, Result};
use crate::family::FamilyTable;
use crate::port::Port;
use crate::registry::{PortRegistry, SYNTHETIC_BUS_BASE};
use crate::settings::Settings;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Index of a bridge device in the topology arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Index of a leaf device in the topology arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeafId(pub usize);

impl fmt::Display for LeafId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "leaf{}", self.0)
    }
}

/// An accelerator (or other managed endpoint) at the bottom of a chain
#[derive(Debug)]
pub struct LeafDevice {
    id: LeafId,
    port: Arc<Port>,
    parent: Option<(DeviceId, usize)>,
}

impl LeafDevice {
    /// Arena index
    pub const fn id(&self) -> LeafId {
        self.id
    }

    /// The leaf's own function
    pub const fn port(&self) -> &Arc<Port> {
        &self.port
    }

    /// Function address
    pub fn addr(&self) -> PciAddress {
        self.port.addr()
    }

    /// Governing device and downstream port index; `None` directly under
    /// the host bridge
    pub const fn parent(&self) -> Option<(DeviceId, usize)> {
        self.parent
    }
}

/// The assembled fabric
#[derive(Debug, Default)]
pub struct Topology {
    devices: Vec<BridgeDevice>,
    leaves: Vec<LeafDevice>,
    roots: Vec<DeviceId>,
}

impl Topology {
    /// Every bridge device, arena order
    pub fn devices(&self) -> &[BridgeDevice] {
        &self.devices
    }

    /// Device by id
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn device(&self, id: DeviceId) -> Result<&BridgeDevice> {
        self.devices
            .get(id.0)
            .ok_or_else(|| PexError::not_found(format!("device {id}")))
    }

    /// Every leaf device
    pub fn leaves(&self) -> &[LeafDevice] {
        &self.leaves
    }

    /// Leaf by id
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn leaf(&self, id: LeafId) -> Result<&LeafDevice> {
        self.leaves
            .get(id.0)
            .ok_or_else(|| PexError::not_found(format!("leaf {id}")))
    }

    /// Leaf at `addr`
    pub fn leaf_by_addr(&self, addr: PciAddress) -> Option<&LeafDevice> {
        self.leaves.iter().find(|l| l.addr() == addr)
    }

    /// Top device of every tree
    ///
    /// Usually root devices; a switch whose upstream bus no port claims
    /// also tops its own tree.
    pub fn roots(&self) -> &[DeviceId] {
        &self.roots
    }

    /// `device` and every ancestor up to its root, nearest first
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn ancestors(&self, device: DeviceId) -> Result<Vec<DeviceId>> {
        let mut chain = Vec::new();
        let mut cur = Some(device);
        while let Some(id) = cur {
            chain.push(id);
            cur = self.device(id)?.parent().map(|(p, _)| p);
            if chain.len() > self.devices.len() {
                return Err(PexError::topology(format!("parent cycle through {device}")));
            }
        }
        Ok(chain)
    }

    /// Devices between a leaf and its root, nearest first
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn chain(&self, leaf: LeafId) -> Result<Vec<DeviceId>> {
        match self.leaf(leaf)?.parent {
            Some((parent, _)) => self.ancestors(parent),
            None => Ok(Vec::new()),
        }
    }

    /// Chain governing `domain:bus:device`
    ///
    /// Uses the registered leaf at that slot when there is one, otherwise
    /// the device whose downstream port has `bus` as its secondary bus.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no device governs that bus.
    pub fn find_device(&self, domain: u16, bus: u8, device: u8) -> Result<Vec<DeviceId>> {
        if let Some(leaf) = self
            .leaves
            .iter()
            .find(|l| l.addr().domain == domain && l.addr().bus == bus && l.addr().device == device)
        {
            return self.chain(leaf.id);
        }

        let governing = self.devices.iter().find(|d| {
            d.downstream_ports()
                .iter()
                .any(|p| p.addr().domain == domain && p.secondary() == u16::from(bus))
        });
        match governing {
            Some(d) => self.ancestors(d.id()),
            None => Err(PexError::not_found(format!(
                "{domain:04x}:{bus:02x}:{device:02x}: no bridge governs this bus"
            ))),
        }
    }

    /// The two ports of the link below downstream port `index` of `device`
    ///
    /// Returns `(parent-side port, child-side port)`; the child side is
    /// `None` when nothing is connected.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown device or port index.
    pub fn link(&self, device: DeviceId, index: usize) -> Result<(&Arc<Port>, Option<&Arc<Port>>)> {
        let dev = self.device(device)?;
        let parent_side = dev.downstream(index)?;
        let child_side = match dev.child(index) {
            Some(Child::Device(c)) => self.device(c)?.upstream(),
            Some(Child::Leaf(l)) => Some(&self.leaf(l)?.port),
            None => None,
        };
        Ok((parent_side, child_side))
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>, id: DeviceId, indent: usize) -> fmt::Result {
        let Ok(dev) = self.device(id) else {
            return Ok(());
        };
        let pad = "  ".repeat(indent);
        match dev.upstream() {
            Some(up) => writeln!(f, "{pad}{id} {} depth={} up={up}", dev.family(), dev.depth().unwrap_or(0))?,
            None => writeln!(f, "{pad}{id} {} (root)", dev.family())?,
        }
        for (i, port) in dev.downstream_ports().iter().enumerate() {
            writeln!(f, "{pad}  [{i}] {port}")?;
            match dev.child(i) {
                Some(Child::Device(c)) => self.write_tree(f, c, indent + 2)?,
                Some(Child::Leaf(l)) => {
                    if let Ok(leaf) = self.leaf(l) {
                        writeln!(f, "{pad}      {l} {}", leaf.port)?;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for root in &self.roots {
            self.write_tree(f, *root, 0)?;
        }
        for leaf in self.leaves.iter().filter(|l| l.parent.is_none()) {
            writeln!(f, "{} {} (host bridge)", leaf.id, leaf.port)?;
        }
        Ok(())
    }
}

/// Builds a [`Topology`] from a populated registry
pub struct TopologyBuilder<'a> {
    registry: &'a PortRegistry,
    access: RegisterAccess,
    settings: Arc<Settings>,
    families: Arc<FamilyTable>,
    devices: Vec<BridgeDevice>,
    groups: HashMap<(u16, u16), DeviceId>,
}

impl<'a> TopologyBuilder<'a> {
    /// Builder over `registry`
    pub fn new(
        registry: &'a PortRegistry,
        access: RegisterAccess,
        settings: Arc<Settings>,
        families: Arc<FamilyTable>,
    ) -> Self {
        Self {
            registry,
            access,
            settings,
            families,
            devices: Vec::new(),
            groups: HashMap::new(),
        }
    }

    /// Resolve every leaf candidate and assemble the topology
    ///
    /// Leaves that fail to scan are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `Topology` if bus ranges are inconsistent.
    pub fn build(mut self) -> Result<Topology> {
        let mut leaves = Vec::new();
        for &addr in self.registry.leaves() {
            let port = match Port::scan(self.access.platform().as_ref(), addr) {
                Ok(p) => Arc::new(p),
                Err(e) => {
                    tracing::warn!("{addr}: leaf skipped: {e}");
                    continue;
                }
            };
            let parent = self.resolve_bus(addr.domain, u16::from(addr.bus), 0)?;
            leaves.push(LeafDevice {
                id: LeafId(leaves.len()),
                port,
                parent,
            });
        }

        let roots = self.connect(&leaves)?;

        let topology = Topology {
            devices: self.devices,
            leaves,
            roots,
        };
        assign_depths(&topology)?;

        for port in topology.devices.iter().flat_map(|d| d.ports()) {
            // upstream half of a split bridge shares registers with its
            // downstream half; only one of them is drained
            if port.secondary() < SYNTHETIC_BUS_BASE {
                port.set_located();
            }
        }
        for leaf in &topology.leaves {
            leaf.port.set_located();
        }

        tracing::info!(
            "Topology: {} devices, {} leaves, {} roots",
            topology.devices.len(),
            topology.leaves.len(),
            topology.roots.len()
        );
        Ok(topology)
    }

    /// Device and port index governing `bus`, building it if needed
    fn resolve_bus(&mut self, domain: u16, bus: u16, hops: usize) -> Result<Option<(DeviceId, usize)>> {
        let Some(port) = self.registry.by_secondary(domain, bus).cloned() else {
            return Ok(None);
        };
        let device = self.resolve_group(domain, port.primary(), hops)?;
        let index = self.devices[device.0]
            .downstream_ports()
            .iter()
            .position(|p| Arc::ptr_eq(p, &port))
            .ok_or_else(|| PexError::topology(format!("{port} missing from its own device")))?;
        Ok(Some((device, index)))
    }

    /// Device whose downstream ports sit on `primary`
    fn resolve_group(&mut self, domain: u16, primary: u16, hops: usize) -> Result<DeviceId> {
        if let Some(&id) = self.groups.get(&(domain, primary)) {
            return Ok(id);
        }
        if hops > usize::from(u8::MAX) + 1 {
            return Err(PexError::topology(format!("bus {primary:#x} nests deeper than the bus space")));
        }

        let siblings = self.registry.siblings(domain, primary);
        let upstream = self.registry.by_secondary(domain, primary).cloned();

        // Parents first
        let parent = match &upstream {
            Some(up) => self.resolve_bus(domain, up.primary(), hops + 1)?,
            None => None,
        };

        let id = DeviceId(self.devices.len());
        let mut device = BridgeDevice::new(
            id,
            upstream,
            siblings,
            self.access.clone(),
            Arc::clone(&self.settings),
            Arc::clone(&self.families),
        );
        device.parent = parent;
        tracing::debug!(
            "device {id}: {} on bus {primary:#x}, {} downstream ports",
            device.family(),
            device.downstream_ports().len()
        );
        self.devices.push(device);
        self.groups.insert((domain, primary), id);
        Ok(id)
    }

    /// Link children to parents; returns the roots
    fn connect(&mut self, leaves: &[LeafDevice]) -> Result<Vec<DeviceId>> {
        let mut roots = Vec::new();

        for n in 0..self.devices.len() {
            let child = &self.devices[n];
            let Some((parent, index)) = child.parent() else {
                if let Some(up) = child.upstream().filter(|_| !child.is_root()) {
                    tracing::warn!(
                        "{up}: no port claims bus {:#x}, device {} becomes the top of its own tree",
                        up.primary(),
                        child.id()
                    );
                }
                roots.push(child.id());
                continue;
            };
            let Some(up) = child.upstream().cloned() else {
                continue;
            };
            // the upstream half of a split bridge only claims its synthetic bus
            let claimed = if up.is_synthetic() {
                child.downstream_ports().iter().map(|p| p.subordinate()).max().unwrap_or(0)
            } else {
                up.subordinate()
            };
            let parent_port = Arc::clone(self.devices[parent.0].downstream(index)?);
            if parent_port.secondary() != up.primary() || parent_port.subordinate() < claimed {
                return Err(PexError::topology(format!(
                    "{parent_port} cannot contain {up} (subordinate {:#x} < {claimed:#x})",
                    parent_port.subordinate(),
                )));
            }
            let id = child.id();
            self.devices[parent.0].children[index] = Some(Child::Device(id));
        }

        for leaf in leaves {
            let Some((parent, index)) = leaf.parent else {
                continue;
            };
            let slot = &mut self.devices[parent.0].children[index];
            if slot.is_none() {
                *slot = Some(Child::Leaf(leaf.id));
            } else {
                tracing::debug!("{}: port already has a child, leaf not linked", leaf.addr());
            }
        }

        Ok(roots)
    }
}

fn assign_depths(topology: &Topology) -> Result<()> {
    let mut queue: VecDeque<(DeviceId, u32)> = topology.roots.iter().map(|r| (*r, 0)).collect();
    while let Some((id, depth)) = queue.pop_front() {
        let dev = topology.device(id)?;
        dev.assign_depth(depth)?;
        for i in 0..dev.downstream_ports().len() {
            if let Some(Child::Device(c)) = dev.child(i) {
                queue.push_back((c, depth + 1));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PciId;
    use crate::platform::{SimFunction, SimPlatform};
    use pexfab_regs::express::port_type;

    const ROOT_PORT: PciId = PciId::new(0x8086, 0x1901);
    const SWITCH: PciId = PciId::new(0x10B5, 0x8747);
    const GPU: PciId = PciId::new(0x10DE, 0x2204);

    fn build(sim: SimPlatform) -> Topology {
        let sim = Arc::new(sim);
        let families = Arc::new(FamilyTable::default());
        let registry = PortRegistry::scan(sim.as_ref(), &families, &[0x03]).unwrap();
        TopologyBuilder::new(
            &registry,
            RegisterAccess::new(sim.clone()),
            Arc::new(Settings::default()),
            families,
        )
        .build()
        .unwrap()
    }

    /// root port -> switch (up + 2 down) -> two GPUs
    fn switch_fabric() -> SimPlatform {
        SimPlatform::new()
            .with(SimFunction::bridge(PciAddress::new(0, 0, 1, 0), ROOT_PORT, port_type::ROOT_PORT, 0, 1, 4))
            .with(SimFunction::bridge(PciAddress::new(0, 1, 0, 0), SWITCH, port_type::UPSTREAM, 1, 2, 4))
            .with(SimFunction::bridge(PciAddress::new(0, 2, 8, 0), SWITCH, port_type::DOWNSTREAM, 2, 3, 3))
            .with(SimFunction::bridge(PciAddress::new(0, 2, 9, 0), SWITCH, port_type::DOWNSTREAM, 2, 4, 4))
            .with(SimFunction::endpoint(PciAddress::new(0, 3, 0, 0), GPU, 0x03_0000))
            .with(SimFunction::endpoint(PciAddress::new(0, 4, 0, 0), GPU, 0x03_0000))
    }

    #[test]
    fn switch_fabric_builds_one_device_for_siblings() {
        let topo = build(switch_fabric());
        assert_eq!(topo.roots().len(), 1);
        assert_eq!(topo.devices().len(), 2);

        let root = topo.device(topo.roots()[0]).unwrap();
        assert!(root.is_root());
        assert_eq!(root.depth(), Some(0));

        let chain0 = topo.chain(LeafId(0)).unwrap();
        let chain1 = topo.chain(LeafId(1)).unwrap();
        assert_eq!(chain0, chain1);
        assert_eq!(chain0.len(), 2);

        let switch = topo.device(chain0[0]).unwrap();
        assert_eq!(switch.downstream_ports().len(), 2);
        assert_eq!(switch.depth(), Some(1));
        assert_eq!(switch.parent(), Some((root.id(), 0)));
        assert_eq!(root.child(0), Some(Child::Device(switch.id())));
        assert_eq!(switch.child(1), Some(Child::Leaf(LeafId(1))));
    }

    #[test]
    fn every_port_is_located() {
        let topo = build(switch_fabric());
        assert!(topo.devices().iter().flat_map(|d| d.ports()).all(|p| p.is_located()));
        assert!(topo.leaves().iter().all(|l| l.port().is_located()));
    }

    #[test]
    fn link_returns_both_ends() {
        let topo = build(switch_fabric());
        let switch = topo.chain(LeafId(0)).unwrap()[0];
        let (parent_side, child_side) = topo.link(switch, 0).unwrap();
        assert_eq!(parent_side.secondary(), 3);
        assert_eq!(child_side.unwrap().addr(), PciAddress::new(0, 3, 0, 0));
    }

    #[test]
    fn leaf_on_root_bus_has_empty_chain() {
        let sim = SimPlatform::new().with(SimFunction::endpoint(PciAddress::new(0, 0, 2, 0), GPU, 0x03_0000));
        let topo = build(sim);
        assert!(topo.chain(LeafId(0)).unwrap().is_empty());
        assert!(topo.devices().is_empty());
    }

    #[test]
    fn switch_on_host_bus_tops_its_own_tree() {
        // no root port claims bus 0
        let sim = SimPlatform::new()
            .with(SimFunction::bridge(PciAddress::new(0, 0, 4, 0), SWITCH, port_type::UPSTREAM, 0, 1, 2))
            .with(SimFunction::bridge(PciAddress::new(0, 1, 0, 0), SWITCH, port_type::DOWNSTREAM, 1, 2, 2))
            .with(SimFunction::endpoint(PciAddress::new(0, 2, 0, 0), GPU, 0x03_0000));
        let topo = build(sim);

        assert_eq!(topo.roots().len(), 1);
        let switch = topo.device(topo.roots()[0]).unwrap();
        assert!(!switch.is_root());
        assert!(switch.parent().is_none());
        assert_eq!(switch.depth(), Some(0));
        assert_eq!(topo.chain(LeafId(0)).unwrap(), vec![switch.id()]);
    }

    #[test]
    fn subordinate_violation_is_a_topology_error() {
        let sim = Arc::new(
            SimPlatform::new()
                .with(SimFunction::bridge(PciAddress::new(0, 0, 1, 0), ROOT_PORT, port_type::ROOT_PORT, 0, 1, 2))
                .with(SimFunction::bridge(PciAddress::new(0, 1, 0, 0), SWITCH, port_type::UPSTREAM, 1, 2, 4))
                .with(SimFunction::bridge(PciAddress::new(0, 2, 0, 0), SWITCH, port_type::DOWNSTREAM, 2, 3, 4))
                .with(SimFunction::endpoint(PciAddress::new(0, 3, 0, 0), GPU, 0x03_0000)),
        );
        let families = Arc::new(FamilyTable::default());
        let registry = PortRegistry::scan(sim.as_ref(), &families, &[0x03]).unwrap();
        let err = TopologyBuilder::new(
            &registry,
            RegisterAccess::new(sim.clone()),
            Arc::new(Settings::default()),
            families,
        )
        .build()
        .unwrap_err();
        assert!(matches!(err, PexError::Topology { .. }));
    }

    #[test]
    fn dump_lists_every_device() {
        let topo = build(switch_fabric());
        let text = topo.to_string();
        assert!(text.contains("(root)"));
        assert!(text.contains("plx-gen3"));
        assert!(text.contains("leaf1"));
    }
}
