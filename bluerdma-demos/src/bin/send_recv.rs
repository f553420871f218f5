//! Two-sided SEND/RECV with out-of-band parameter exchange.
//!
//! Runs a server and a client endpoint in one process (the engine routes
//! by QP number within a device), connected over a real TCP socket that
//! carries the {rkey, raddr, qpn} bootstrap exchange and the start
//! barrier. The server pre-posts one receive, the client posts one SEND
//! of `msg_len` bytes, and both sides poll their CQ for exactly one
//! completion.
//!
//! Usage: `send_recv [msg_len]` (default 4096).

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bluerdma::device::{Device, DeviceConfig, DeviceRegistry, Mtu, PORT_NUM};
use bluerdma::mr::{AccessFlags, OwnedMemoryRegion};
use bluerdma::qp::{QpInitAttr, QueuePair};
use bluerdma::wc::WorkCompletion;
use bluerdma::wr::{RecvWr, SendFlags, SendWr, WrOpcode};
use bluerdma_demos::bootstrap::{barrier, exchange, EndpointInfo};

type DemoError = Box<dyn std::error::Error + Send + Sync>;

const BUF_SIZE: usize = 1024 * 1024;
const SEND_WR_ID: u64 = 7;
const RECV_WR_ID: u64 = 9;

struct Endpoint {
    mr: OwnedMemoryRegion,
    qp: QueuePair,
    cq: Arc<bluerdma::cq::CompletionQueue>,
}

fn setup(device: &Device) -> Result<Endpoint, DemoError> {
    let ctx = device.open()?;
    let pd = ctx.alloc_pd()?;
    let mr = pd.reg_mr_owned(
        vec![0u8; BUF_SIZE],
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ,
    )?;
    let cq = ctx.create_cq(16)?;
    let qp = pd.create_qp(
        &cq,
        &cq,
        &QpInitAttr {
            max_send_wr: 1,
            max_recv_wr: 1,
            ..Default::default()
        },
    )?;
    Ok(Endpoint { mr, qp, cq })
}

fn connect(ep: &Endpoint, dqpn: u32) -> Result<(), DemoError> {
    let ctx = ep.qp.pd().context();
    ep.qp.to_init(
        PORT_NUM,
        0,
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ,
    )?;
    let dgid = ctx.query_gid(PORT_NUM, 0)?;
    ep.qp.to_rtr(dqpn, 0, dgid, Mtu::Mtu4096)?;
    ep.qp.to_rts(0)?;
    Ok(())
}

fn poll_one(ep: &Endpoint) -> Result<WorkCompletion, DemoError> {
    let mut wc = [WorkCompletion::default(); 1];
    while ep.cq.poll(&mut wc)? == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    Ok(wc[0])
}

fn run_server(device: Device, msg_len: usize, port: u16) -> Result<(), DemoError> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    println!("server waiting for connection...");
    let (mut sock, _) = listener.accept()?;

    let ep = setup(&device)?;
    let local = EndpointInfo {
        rkey: ep.mr.rkey(),
        addr: ep.mr.addr(),
        qpn: ep.qp.qp_num(),
    };
    let peer = exchange(&mut sock, &local)?;
    connect(&ep, peer.qpn)?;

    ep.qp
        .post_recv(&[RecvWr::new(RECV_WR_ID).sg(ep.mr.sge(0, BUF_SIZE as u32))])?;
    barrier(&mut sock)?;

    let wc = poll_one(&ep)?.ok()?;
    if wc.byte_len() as usize != msg_len {
        return Err(format!("expected {msg_len} bytes, got {}", wc.byte_len()).into());
    }
    let valid = ep.mr.as_slice()[..msg_len]
        .iter()
        .filter(|&&b| b == b'a')
        .count();
    println!("received bytes count: {valid}");
    Ok(())
}

fn run_client(device: Device, msg_len: usize, port: u16) -> Result<(), DemoError> {
    let mut sock = loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(sock) => break sock,
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    };

    let mut ep = setup(&device)?;
    ep.mr.as_mut_slice()[..msg_len].fill(b'a');
    let local = EndpointInfo {
        rkey: ep.mr.rkey(),
        addr: ep.mr.addr(),
        qpn: ep.qp.qp_num(),
    };
    let peer = exchange(&mut sock, &local)?;
    println!("dqpn: {}", peer.qpn);
    connect(&ep, peer.qpn)?;

    barrier(&mut sock)?;
    let wr = SendWr::new(SEND_WR_ID, WrOpcode::Send)
        .flags(SendFlags::SIGNALED)
        .sg(ep.mr.sge(0, msg_len as u32));
    ep.qp.post_send(&[wr])?;

    poll_one(&ep)?.ok()?;
    Ok(())
}

fn main() -> Result<(), DemoError> {
    tracing_subscriber::fmt::try_init().ok();

    let msg_len: usize = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(4096);
    let port = 12346;

    let registry = DeviceRegistry::new(1, DeviceConfig::default())?;
    let device = registry.first()?.clone();

    let server_dev = device.clone();
    let server = thread::spawn(move || run_server(server_dev, msg_len, port));
    run_client(device, msg_len, port)?;
    match server.join() {
        Ok(result) => result?,
        Err(_) => return Err("server thread panicked".into()),
    }
    Ok(())
}
