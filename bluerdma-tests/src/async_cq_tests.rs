//! Async CQ poller tests (feature `tokio`).

use std::sync::Arc;
use std::time::Duration;

use bluerdma::async_cq::AsyncCq;
use bluerdma::comp_channel::CompletionChannel;
use bluerdma::device::{DeviceConfig, DeviceRegistry, Mtu, PORT_NUM};
use bluerdma::qp::{QpInitAttr, QueuePair};
use bluerdma::wc::WorkCompletion;
use bluerdma::wr::{RecvWr, SendFlags, SendWr, WrOpcode};

use crate::util::full_access;

struct AsyncFixture {
    qp0: QueuePair,
    qp1: QueuePair,
    async_cq: AsyncCq,
    pd: Arc<bluerdma::pd::ProtectionDomain>,
    _registry: DeviceRegistry,
}

/// Two connected QPs where qp1's receive CQ is wired to an async poller.
fn async_pair() -> AsyncFixture {
    let registry = DeviceRegistry::new(1, DeviceConfig::default()).unwrap();
    let ctx = registry.first().unwrap().open().unwrap();
    let pd = ctx.alloc_pd().unwrap();
    let channel = Arc::new(CompletionChannel::new());
    let cq0 = ctx.create_cq(16).unwrap();
    let cq1 = ctx
        .create_cq_with_channel(16, Arc::clone(&channel))
        .unwrap();

    let qp0 = pd.create_qp(&cq0, &cq0, &QpInitAttr::default()).unwrap();
    let qp1 = pd.create_qp(&cq1, &cq1, &QpInitAttr::default()).unwrap();
    let dgid = ctx.query_gid(PORT_NUM, 0).unwrap();
    for (qp, peer) in [(&qp0, qp1.qp_num()), (&qp1, qp0.qp_num())] {
        qp.to_init(PORT_NUM, 0, full_access()).unwrap();
        qp.to_rtr(peer, 0, dgid, Mtu::Mtu4096).unwrap();
        qp.to_rts(0).unwrap();
    }

    AsyncFixture {
        qp0,
        qp1,
        async_cq: AsyncCq::new(cq1, channel),
        pd,
        _registry: registry,
    }
}

#[tokio::test]
async fn async_poll_wakes_on_completion() {
    let fixture = async_pair();
    let recv_mr = fixture
        .pd
        .reg_mr_owned(vec![0u8; 256], full_access())
        .unwrap();
    fixture
        .qp1
        .post_recv(&[RecvWr::new(21).sg(recv_mr.sge(0, 256))])
        .unwrap();

    let send_mr = fixture
        .pd
        .reg_mr_owned(vec![4u8; 256], full_access())
        .unwrap();

    // Post from a blocking task after a delay so the poller really waits.
    let qp0 = fixture.qp0;
    let sender = tokio::task::spawn_blocking(move || {
        std::thread::sleep(Duration::from_millis(50));
        qp0.post_send(&[SendWr::new(22, WrOpcode::Send)
            .flags(SendFlags::SIGNALED)
            .sg(send_mr.sge(0, 256))])
            .unwrap();
    });

    let mut wc = [WorkCompletion::default(); 4];
    let n = fixture.async_cq.poll(&mut wc).await.unwrap();
    assert!(n >= 1);
    assert_eq!(wc[0].wr_id(), 21);
    assert!(wc[0].is_success());
    sender.await.unwrap();
}

#[tokio::test]
async fn async_poll_drains_already_queued_completions() {
    let fixture = async_pair();
    let recv_mr = fixture
        .pd
        .reg_mr_owned(vec![0u8; 64], full_access())
        .unwrap();
    fixture
        .qp1
        .post_recv(&[RecvWr::new(31).sg(recv_mr.sge(0, 64))])
        .unwrap();
    let send_mr = fixture
        .pd
        .reg_mr_owned(vec![1u8; 64], full_access())
        .unwrap();
    fixture
        .qp0
        .post_send(&[SendWr::new(32, WrOpcode::Send).sg(send_mr.sge(0, 64))])
        .unwrap();

    // The completion is already queued; poll must not sleep forever.
    let wc = fixture.async_cq.poll_wr_id(31).await.unwrap();
    assert_eq!(wc.byte_len(), 64);
}
