//! Sysfs platform over a fake `/sys` tree
//!
//! Config files are plain 4 KiB files, so discovery and config writes go
//! through the real pread/pwrite path without hardware.

use pexfab_driver::prelude::*;
use pexfab_regs::{config, express};
use std::fs;
use std::path::Path;

const PCIE_CAP: usize = 0x40;

fn put(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Config space of one function with a PCI Express capability at 0x40
fn function(id: u32, class: u32, header: u32, port_type: u32, buses: Option<(u8, u8, u8)>) -> Vec<u8> {
    let mut buf = vec![0u8; usize::from(config::EXTENDED_SIZE)];
    put(&mut buf, usize::from(config::ID), id);
    put(&mut buf, usize::from(config::COMMAND_STATUS), config::STATUS_CAP_LIST);
    put(&mut buf, usize::from(config::CLASS_REVISION), class << 8);
    put(&mut buf, usize::from(config::HEADER_DWORD), header << 16);
    if let Some((p, s, sub)) = buses {
        put(
            &mut buf,
            usize::from(config::BUS_NUMBERS),
            u32::from(p) | (u32::from(s) << 8) | (u32::from(sub) << 16),
        );
    }
    put(&mut buf, usize::from(config::CAP_PTR), PCIE_CAP as u32);
    put(
        &mut buf,
        PCIE_CAP,
        u32::from(config::cap_id::PCI_EXPRESS) | (2 << 16) | (port_type << 20),
    );
    // Gen3 x16, L0s + L1 supported
    put(
        &mut buf,
        PCIE_CAP + usize::from(express::LINK_CAP),
        3 | (16 << express::link::CAP_WIDTH_LO) | (0b11 << 10),
    );
    buf
}

fn add_device(root: &Path, addr: &str, config_space: &[u8]) {
    let dir = root.join("bus/pci/devices").join(addr);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config"), config_space).unwrap();
}

fn fake_sys() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    add_device(
        tmp.path(),
        "0000:00:01.0",
        &function(
            0x1483_1022,
            config::CLASS_PCI_BRIDGE,
            config::HEADER_TYPE_BRIDGE,
            express::port_type::ROOT_PORT,
            Some((0, 1, 1)),
        ),
    );
    add_device(
        tmp.path(),
        "0000:01:00.0",
        &function(
            0x2204_10DE,
            0x03_0000,
            config::HEADER_TYPE_NORMAL,
            express::port_type::ENDPOINT,
            None,
        ),
    );
    tmp
}

/// root port -> switch (01:00.0 up, 02:00.0 down) -> GPU at 03:00.0
fn fake_switched_sys() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    let bridge = |kind, buses| {
        function(0x2824_1B21, config::CLASS_PCI_BRIDGE, config::HEADER_TYPE_BRIDGE, kind, Some(buses))
    };
    add_device(
        tmp.path(),
        "0000:00:01.0",
        &function(
            0x1483_1022,
            config::CLASS_PCI_BRIDGE,
            config::HEADER_TYPE_BRIDGE,
            express::port_type::ROOT_PORT,
            Some((0, 1, 3)),
        ),
    );
    add_device(tmp.path(), "0000:01:00.0", &bridge(express::port_type::UPSTREAM, (1, 2, 3)));
    add_device(tmp.path(), "0000:02:00.0", &bridge(express::port_type::DOWNSTREAM, (2, 3, 3)));
    add_device(
        tmp.path(),
        "0000:03:00.0",
        &function(0x2204_10DE, 0x03_0000, config::HEADER_TYPE_NORMAL, express::port_type::ENDPOINT, None),
    );
    tmp
}

fn manager(root: &Path) -> Manager {
    Manager::linux(ManagerConfig {
        sysfs_root: root.to_path_buf(),
        ..ManagerConfig::default()
    })
}

#[test]
fn discovers_fabric_from_sysfs_tree() {
    let tmp = fake_sys();
    let manager = manager(tmp.path());
    let topology = manager.find_devices().unwrap();

    assert_eq!(topology.devices().len(), 1);
    assert_eq!(topology.leaves().len(), 1);
    let leaf = manager.leaf_id("0000:01:00.0".parse().unwrap()).unwrap();
    assert_eq!(manager.chain(leaf).unwrap(), topology.roots().to_vec());
}

#[test]
fn aspm_writes_land_in_config_files() {
    let tmp = fake_sys();
    let manager = manager(tmp.path());
    manager.find_devices().unwrap();
    let root = manager.topology().unwrap().roots()[0];

    assert_eq!(manager.set_link_aspm(root, 0, Aspm::L1, false).unwrap(), Aspm::L1);

    let link_ctl = PCIE_CAP + usize::from(express::LINK_CTL_STA);
    for addr in ["0000:00:01.0", "0000:01:00.0"] {
        let bytes = fs::read(tmp.path().join("bus/pci/devices").join(addr).join("config")).unwrap();
        assert_eq!(Aspm::from_bits(get(&bytes, link_ctl)), Aspm::L1, "{addr}");
    }
}

#[test]
fn performance_policy_disables_restored_aspm() {
    let tmp = fake_switched_sys();
    let params = tmp.path().join("module/pcie_aspm/parameters");
    fs::create_dir_all(&params).unwrap();
    fs::write(params.join("policy"), "default [performance] powersave\n").unwrap();

    let manager = manager(tmp.path());
    manager.find_devices().unwrap();
    let leaf = manager.leaf_id("0000:03:00.0".parse().unwrap()).unwrap();
    let chain = manager.chain(leaf).unwrap();
    assert_eq!(chain.len(), 2);
    let switch = chain[0];

    manager.set_link_aspm(switch, 0, Aspm::L1, false).unwrap();
    let session = manager.save_setting(leaf, SaveMask::ASPM).unwrap();
    assert_eq!(manager.session(session).unwrap().hops.len(), 1);
    manager
        .restore_setting(session, SaveMask::ASPM, RestoreOptions::default())
        .unwrap();
    assert_eq!(manager.device(switch).unwrap().downstream_aspm(0).unwrap(), Aspm::Disabled);
}

#[test]
fn missing_tree_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(&tmp.path().join("nope"));
    assert!(matches!(manager.find_devices(), Err(PexError::NotFound { .. })));
}
