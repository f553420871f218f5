//! Device registry, context and dispatch-table tests.

use std::sync::Arc;

use bluerdma::device::{
    Device, DeviceAttr, DeviceConfig, DeviceRegistry, PortState, ABI_VERSION, PORT_NUM,
};
use bluerdma::ops::{BackendModule, Verb, VerbsProvider};
use bluerdma::{Error, Result};

fn registry() -> DeviceRegistry {
    DeviceRegistry::new(2, DeviceConfig::default()).expect("registry")
}

#[test]
fn registry_creates_named_devices() {
    let registry = registry();
    let devs = registry.devices();
    assert_eq!(devs.len(), 2);
    assert_eq!(devs[0].name(), "bluerdma0");
    assert_eq!(devs[1].name(), "bluerdma1");
    assert_eq!(devs[0].netdev().name(), "blue0");
    assert_eq!(devs[1].netdev().name(), "blue1");
    for d in devs {
        println!("Device: {} (guid={:#x})", d.name(), d.guid());
        assert_ne!(d.guid(), 0);
    }
}

#[test]
fn registry_lookup() {
    let registry = registry();
    assert_eq!(registry.device_by_name("bluerdma1").unwrap().id(), 1);
    assert!(matches!(
        registry.device_by_name("bluerdma9"),
        Err(Error::DeviceNotFound(_))
    ));
    assert!(registry.device(1).is_ok());
    assert!(matches!(registry.device(2), Err(Error::InvalidArg(_))));
}

#[test]
fn zero_devices_rejected() {
    assert!(matches!(
        DeviceRegistry::new(0, DeviceConfig::default()),
        Err(Error::InvalidArg(_))
    ));
}

#[test]
fn query_device_reports_limits() {
    let registry = registry();
    let ctx = registry.first().unwrap().open().unwrap();
    let attr = ctx.query_device().expect("query_device");
    println!(
        "max_qp={}, max_cq={}, max_mr={}",
        attr.max_qp, attr.max_cq, attr.max_mr
    );
    assert!(attr.max_qp > 0);
    assert!(attr.max_cq > 0);
    assert!(attr.max_mr > 0);
    assert_eq!(attr.phys_port_cnt, 1);
    assert_eq!(attr.abi_version, ABI_VERSION);
    assert_eq!(attr.node_desc, "bluerdma");
}

#[test]
fn query_port_and_carrier() {
    let registry = registry();
    let device = registry.first().unwrap();
    let ctx = device.open().unwrap();

    let attr = ctx.query_port(PORT_NUM).expect("query_port");
    assert_eq!(attr.state, PortState::Active);
    assert_eq!(attr.gid_tbl_len, 16);
    assert_eq!(attr.pkey_tbl_len, 1);

    device.netdev().stop();
    let attr = ctx.query_port(PORT_NUM).expect("query_port");
    assert_eq!(attr.state, PortState::Down);

    assert!(matches!(ctx.query_port(2), Err(Error::InvalidArg(_))));
}

#[test]
fn default_gid_is_eui64_of_mac() {
    let registry = registry();
    let device = registry.first().unwrap();
    let ctx = device.open().unwrap();
    let gid = ctx.query_gid(PORT_NUM, 0).expect("query_gid");
    let raw = gid.raw();
    let mac = device.mac().octets();

    assert_eq!(&raw[..2], &[0xfe, 0x80]);
    assert_eq!(raw[8], mac[0] ^ 0x02);
    assert_eq!(raw[9], mac[1]);
    assert_eq!(raw[10], mac[2]);
    assert_eq!(&raw[11..13], &[0xff, 0xfe]);
    assert_eq!(raw[13], mac[3]);
    assert_eq!(&raw[14..], &mac[4..]);
}

#[test]
fn sysfs_style_attrs() {
    let registry = registry();
    let device = registry.first().unwrap();
    let ctx = device.open().unwrap();

    let mac_text = device.mac_attr();
    assert_eq!(mac_text, format!("{}\n", device.mac()));

    let gids = device.gids_attr();
    let gid0 = ctx.query_gid(PORT_NUM, 0).unwrap();
    assert_eq!(gids.lines().count(), 1);
    assert_eq!(gids.lines().next().unwrap(), gid0.to_string());
}

#[test]
fn pkey_table() {
    let registry = registry();
    let ctx = registry.first().unwrap().open().unwrap();
    assert_eq!(ctx.query_pkey(PORT_NUM, 0).unwrap(), 1);
    assert!(matches!(
        ctx.query_pkey(PORT_NUM, 1),
        Err(Error::InvalidArg(_))
    ));
    assert!(matches!(ctx.query_pkey(3, 0), Err(Error::InvalidArg(_))));
}

#[test]
fn netdev_mtu_changes_are_bounded() {
    let registry = registry();
    let netdev = registry.first().unwrap().netdev();
    assert_eq!(netdev.mtu(), 1500);
    netdev.set_mtu(9000).expect("set_mtu");
    assert_eq!(netdev.mtu(), 9000);
    assert!(matches!(netdev.set_mtu(10), Err(Error::InvalidArg(_))));
    assert!(matches!(netdev.set_mtu(100_000), Err(Error::InvalidArg(_))));
    assert_eq!(netdev.mtu(), 9000);
}

#[test]
fn path_mtu_values() {
    use bluerdma::device::Mtu;
    assert_eq!(Mtu::Mtu256.bytes(), 256);
    assert_eq!(Mtu::Mtu4096.bytes(), 4096);
    assert!(Mtu::Mtu1024 < Mtu::Mtu4096);
    assert_eq!(Mtu::default(), Mtu::Mtu1024);
}

#[test]
fn port_immutable_data() {
    let registry = registry();
    let ctx = registry.first().unwrap().open().unwrap();
    let imm = ctx.port_immutable(PORT_NUM).unwrap();
    assert_eq!(imm.gid_tbl_len, 16);
    assert_eq!(imm.pkey_tbl_len, 1);
}

#[test]
fn unresolved_slots_fail_cleanly() {
    let registry = registry();
    let ctx = registry.first().unwrap().open().unwrap();
    assert!(ctx.supports(Verb::PostSend));
    assert!(!ctx.supports(Verb::CreateSrq));
    assert!(!ctx.supports(Verb::ResizeCq));

    let cq = ctx.create_cq(16).unwrap();
    assert!(matches!(
        cq.resize(32),
        Err(Error::Unsupported(Verb::ResizeCq))
    ));
}

#[test]
fn verb_symbol_convention() {
    assert_eq!(Verb::PostSend.symbol(), "bluerdma_post_send");
    assert_eq!(Verb::QueryDeviceEx.symbol(), "bluerdma_query_device_ex");
}

// --- backend module wiring ---

struct MockProvider;

impl VerbsProvider for MockProvider {
    fn provided(&self) -> &[Verb] {
        &[Verb::QueryDevice]
    }

    fn query_device(&self, dev: &Device) -> Result<DeviceAttr> {
        Ok(DeviceAttr {
            node_desc: "mock".to_owned(),
            node_guid: dev.guid(),
            max_qp: 7,
            max_cq: 7,
            max_mr: 7,
            max_pd: 7,
            max_qp_wr: 7,
            max_sge: 7,
            max_cqe: 7,
            phys_port_cnt: 1,
            abi_version: ABI_VERSION,
        })
    }
}

struct MockModule;

impl BackendModule for MockModule {
    fn open(&self, device_name: &str) -> Result<Box<dyn VerbsProvider>> {
        println!("mock backend opened for {device_name}");
        Ok(Box::new(MockProvider))
    }
}

struct FailingModule;

impl BackendModule for FailingModule {
    fn open(&self, _device_name: &str) -> Result<Box<dyn VerbsProvider>> {
        Err(Error::Backend("mandatory entry point missing".into()))
    }
}

#[test]
fn backend_overrides_listed_slots_only() {
    let registry =
        DeviceRegistry::with_backend(1, DeviceConfig::default(), Arc::new(MockModule))
            .expect("registry");
    let ctx = registry.first().unwrap().open().unwrap();

    // Overridden slot answers from the backend.
    let attr = ctx.query_device().unwrap();
    assert_eq!(attr.node_desc, "mock");
    assert_eq!(attr.max_qp, 7);

    // Slots the backend did not list keep the core default.
    let port = ctx.query_port(PORT_NUM).unwrap();
    assert_eq!(port.gid_tbl_len, 16);
}

#[test]
fn failing_backend_fails_device_allocation() {
    let result = DeviceRegistry::with_backend(1, DeviceConfig::default(), Arc::new(FailingModule));
    assert!(matches!(result, Err(Error::Backend(_))));
}
