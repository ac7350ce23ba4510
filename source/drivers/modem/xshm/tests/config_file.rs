//! CONTEXT: Channel tables loaded from TOML files
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 integration tests
//!
//! TEST_SCOPE:
//!   - Loading a platform channel table from disk
//!   - Registering and opening channels from the loaded table
//!   - Error reporting for missing and malformed files
//!
//! TEST_SCENARIOS:
//!   - table_loads_and_opens(): both channels validate, register and open
//!   - missing_file_reports_path(): read failures carry the offending path
//!   - malformed_file_reports_parse_error(): TOML errors carry the offending path
//!
//! DEPENDENCIES:
//!   - modem_xshm::{XshmConfig, Registry}: table loading and device registry
//!   - tempfile::TempDir: scratch directory for table files

use std::io::Write;
use std::sync::Arc;

use modem_xshm::{
    ConfigLoadError, DeviceState, DoorbellLatch, DriverCallbacks, HostSharedMemory, Link, Mode, Registry,
    XshmConfig,
};
use tempfile::TempDir;

const REGION: usize = 4096;

const TABLE: &str = r#"
[[channel]]
name = "at0"
mode = "stream"
excl_group = 1
priority = 2

[channel.rx]
base = 64
buffers = 1
ch_size = 256
alignment = 4
xfer_bit = 0
xfer_done_bit = 1
state = 0
read = 4
write = 8
geometry = "stream"

[channel.tx]
base = 320
buffers = 1
ch_size = 256
alignment = 4
xfer_bit = 2
xfer_done_bit = 3
state = 12
read = 16
write = 20
geometry = "stream"

[[channel]]
name = "caif0"
mode = "packet"
excl_group = 2
latency = 10

[channel.rx]
base = 1088
buffers = 4
ch_size = 1024
alignment = 32
xfer_bit = 4
xfer_done_bit = 5
state = 1024
read = 1028
write = 1032
geometry = { packet = { mtu = 256, packets = 1, buf_size = 1036 } }

[channel.tx]
base = 2176
buffers = 4
ch_size = 1024
alignment = 32
xfer_bit = 6
xfer_done_bit = 7
state = 2112
read = 2116
write = 2120
geometry = { packet = { mtu = 256, packets = 1, buf_size = 2124 } }
"#;

struct Quiet;

impl DriverCallbacks for Quiet {
    fn open_cb(&self) {}
    fn close_cb(&self) {}
    fn ipc_rx_cb(&self) {}
    fn ipc_tx_release_cb(&self, _more: bool) {}
}

#[test]
fn table_loads_and_opens() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("xshm.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, "{TABLE}").unwrap();

    let table = XshmConfig::load_file(&path).expect("table loads");
    table.validate(REGION).expect("table is consistent");
    assert_eq!(table.channels.len(), 2);
    assert_eq!(table.channels[0].mode, Mode::Stream);
    assert_eq!(table.channels[1].mode, Mode::Packet);
    assert_eq!(table.channels[1].latency, 10);
    assert_eq!(table.channels[1].rx.max_payload(), 256);

    let registry = Registry::new();
    let link = Link::new(Arc::new(HostSharedMemory::new(REGION)), Arc::new(DoorbellLatch::new()));
    for channel in table.channels {
        registry.register(channel, link.clone(), Arc::new(Quiet)).expect("register");
    }
    for device in registry.devices() {
        device.open().expect("open");
        assert_eq!(device.state(), DeviceState::Opening);
    }
    assert_eq!(registry.group_holder(1).as_deref(), Some("at0"));
    assert_eq!(registry.group_holder(2).as_deref(), Some("caif0"));
}

#[test]
fn missing_file_reports_path() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("absent.toml");
    match XshmConfig::load_file(&path) {
        Err(ConfigLoadError::Read { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected read error, got {other:?}"),
    }
}

#[test]
fn malformed_file_reports_parse_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("broken.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "[[channel]]\nname = \"at0\"\nmode = \"carrier-pigeon\"").unwrap();
    assert!(matches!(XshmConfig::load_file(&path), Err(ConfigLoadError::Parse { .. })));
}
