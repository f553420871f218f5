//! Loopback RDMA WRITE between two QPs on one device.
//!
//! Carves a source and a destination region out of a single MR, connects
//! two QPs to each other, posts one signaled RDMA WRITE and verifies the
//! destination bytes after the completion arrives.
//!
//! Usage: `loopback [msg_len]` (default 4096).

use std::thread;
use std::time::Duration;

use bluerdma::device::{DeviceConfig, DeviceRegistry, Mtu, PORT_NUM};
use bluerdma::mr::AccessFlags;
use bluerdma::qp::QpInitAttr;
use bluerdma::wc::WorkCompletion;
use bluerdma::wr::{SendFlags, SendWr, WrOpcode};

const WRITE_WR_ID: u64 = 17;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::try_init().ok();

    let msg_len: usize = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(4096);

    let registry = DeviceRegistry::new(1, DeviceConfig::default())?;
    let device = registry.first()?;
    let ctx = device.open()?;
    let pd = ctx.alloc_pd()?;

    let send_cq = ctx.create_cq(512)?;
    let recv_cq = ctx.create_cq(512)?;

    let init_attr = QpInitAttr {
        max_send_wr: 100,
        max_recv_wr: 100,
        max_send_sge: 16,
        max_recv_sge: 16,
        ..Default::default()
    };
    let qp0 = pd.create_qp(&send_cq, &recv_cq, &init_attr)?;
    let qp1 = pd.create_qp(&send_cq, &recv_cq, &init_attr)?;

    let access =
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
    qp0.to_init(PORT_NUM, 0, access)?;
    qp1.to_init(PORT_NUM, 0, access)?;

    let dgid = ctx.query_gid(PORT_NUM, 0)?;
    qp0.to_rtr(qp1.qp_num(), 0, dgid, Mtu::Mtu4096)?;
    qp0.to_rts(0)?;
    qp1.to_rtr(qp0.qp_num(), 0, dgid, Mtu::Mtu4096)?;
    qp1.to_rts(0)?;

    // One MR covering both regions: [0, msg_len) source, [msg_len, 2x) destination.
    let mut buf = vec![0u8; msg_len * 2];
    for (i, byte) in buf[..msg_len].iter_mut().enumerate() {
        *byte = (i & 0xff) as u8;
    }
    let mr = pd.reg_mr_owned(buf, access)?;

    let wr = SendWr::new(WRITE_WR_ID, WrOpcode::RdmaWrite)
        .flags(SendFlags::SIGNALED)
        .sg(mr.sge(0, msg_len as u32))
        .rdma(mr.addr() + msg_len as u64, mr.rkey());
    qp0.post_send(&[wr])?;

    let mut wc = [WorkCompletion::default(); 1];
    while send_cq.poll(&mut wc)? == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    println!("wc wr_id: {}", wc[0].wr_id());
    wc[0].ok()?;

    let slice = mr.as_slice();
    let valid = slice[..msg_len]
        .iter()
        .zip(&slice[msg_len..msg_len * 2])
        .filter(|(src, dst)| src == dst)
        .count();
    println!("received bytes count: {valid}");
    if valid != msg_len {
        return Err(format!("only {valid} of {msg_len} bytes matched").into());
    }
    Ok(())
}
