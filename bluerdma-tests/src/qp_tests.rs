//! QP state machine tests.

use bluerdma::device::{DeviceConfig, DeviceRegistry, Mtu, PORT_NUM};
use bluerdma::gid::Gid;
use bluerdma::qp::{AddressVector, QpAttr, QpAttrMask, QpInitAttr};
use bluerdma::wc::WcStatus;
use bluerdma::wr::{QpState, RecvWr, SendWr, WrOpcode};
use bluerdma::Error;

use crate::util::{connect_pair, full_access, poll_n};

struct Fixture {
    registry: DeviceRegistry,
}

impl Fixture {
    fn new() -> Self {
        Self {
            registry: DeviceRegistry::new(1, DeviceConfig::default()).unwrap(),
        }
    }

    fn qp(&self) -> (bluerdma::qp::QueuePair, std::sync::Arc<bluerdma::device::Context>) {
        let ctx = self.registry.first().unwrap().open().unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(16).unwrap();
        let qp = pd.create_qp(&cq, &cq, &QpInitAttr::default()).unwrap();
        (qp, ctx)
    }
}

fn rtr_attr(dgid: Gid) -> (QpAttr, QpAttrMask) {
    let attr = QpAttr {
        qp_state: QpState::Rtr,
        path_mtu: Mtu::Mtu4096,
        dest_qp_num: 42,
        rq_psn: 0,
        max_dest_rd_atomic: 1,
        min_rnr_timer: 12,
        ah_attr: AddressVector {
            dgid,
            port_num: PORT_NUM,
        },
        ..Default::default()
    };
    let mask = QpAttrMask::STATE
        | QpAttrMask::AV
        | QpAttrMask::PATH_MTU
        | QpAttrMask::DEST_QPN
        | QpAttrMask::RQ_PSN
        | QpAttrMask::MAX_DEST_RD_ATOMIC
        | QpAttrMask::MIN_RNR_TIMER;
    (attr, mask)
}

#[test]
fn created_in_reset_with_unique_numbers() {
    let fixture = Fixture::new();
    let (qp0, _) = fixture.qp();
    let (qp1, _) = fixture.qp();
    assert_eq!(qp0.state(), QpState::Reset);
    assert_ne!(qp0.qp_num(), qp1.qp_num());
}

#[test]
fn init_attr_validation() {
    let fixture = Fixture::new();
    let ctx = fixture.registry.first().unwrap().open().unwrap();
    let pd = ctx.alloc_pd().unwrap();
    let cq = ctx.create_cq(16).unwrap();

    for bad in [
        QpInitAttr {
            max_send_wr: 0,
            ..Default::default()
        },
        QpInitAttr {
            max_recv_sge: 0,
            ..Default::default()
        },
        QpInitAttr {
            max_send_wr: 1 << 20,
            ..Default::default()
        },
        QpInitAttr {
            max_send_sge: 1 << 20,
            ..Default::default()
        },
    ] {
        assert!(matches!(
            pd.create_qp(&cq, &cq, &bad),
            Err(Error::InvalidArg(_))
        ));
    }
}

#[test]
fn full_ladder_succeeds() {
    let fixture = Fixture::new();
    let (qp, ctx) = fixture.qp();
    let dgid = ctx.query_gid(PORT_NUM, 0).unwrap();

    qp.to_init(PORT_NUM, 0, full_access()).expect("to_init");
    assert_eq!(qp.state(), QpState::Init);
    qp.to_rtr(42, 0, dgid, Mtu::Mtu4096).expect("to_rtr");
    assert_eq!(qp.state(), QpState::Rtr);
    qp.to_rts(0).expect("to_rts");
    assert_eq!(qp.state(), QpState::Rts);
}

#[test]
fn missing_fields_leave_state_unchanged() {
    let fixture = Fixture::new();
    let (qp, ctx) = fixture.qp();
    let dgid = ctx.query_gid(PORT_NUM, 0).unwrap();

    // No target state at all.
    let err = qp.modify(&QpAttr::default(), QpAttrMask::PORT).unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
    assert_eq!(qp.state(), QpState::Reset);

    // RESET->INIT with access flags missing.
    let attr = QpAttr {
        qp_state: QpState::Init,
        port_num: PORT_NUM,
        ..Default::default()
    };
    let err = qp
        .modify(
            &attr,
            QpAttrMask::STATE | QpAttrMask::PORT | QpAttrMask::PKEY_INDEX,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
    assert_eq!(qp.state(), QpState::Reset);

    qp.to_init(PORT_NUM, 0, full_access()).unwrap();

    // INIT->RTR with every required bit except DEST_QPN.
    let (attr, mask) = rtr_attr(dgid);
    let err = qp.modify(&attr, mask - QpAttrMask::DEST_QPN).unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
    assert_eq!(qp.state(), QpState::Init);

    qp.modify(&attr, mask).unwrap();

    // RTR->RTS missing the send PSN.
    let rts = QpAttr {
        qp_state: QpState::Rts,
        timeout: 14,
        retry_cnt: 7,
        rnr_retry: 7,
        max_rd_atomic: 1,
        ..Default::default()
    };
    let mask = QpAttrMask::STATE
        | QpAttrMask::TIMEOUT
        | QpAttrMask::RETRY_CNT
        | QpAttrMask::RNR_RETRY
        | QpAttrMask::MAX_QP_RD_ATOMIC;
    let err = qp.modify(&rts, mask).unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
    assert_eq!(qp.state(), QpState::Rtr);
}

#[test]
fn skipping_a_rung_is_a_state_conflict() {
    let fixture = Fixture::new();
    let (qp, ctx) = fixture.qp();
    let dgid = ctx.query_gid(PORT_NUM, 0).unwrap();

    // RESET -> RTR skips INIT.
    let (attr, mask) = rtr_attr(dgid);
    assert!(matches!(qp.modify(&attr, mask), Err(Error::State { .. })));
    assert_eq!(qp.state(), QpState::Reset);

    // Re-entering INIT from INIT is also a conflict.
    qp.to_init(PORT_NUM, 0, full_access()).unwrap();
    assert!(matches!(
        qp.to_init(PORT_NUM, 0, full_access()),
        Err(Error::State { .. })
    ));
}

#[test]
fn bad_port_or_pkey_rejected() {
    let fixture = Fixture::new();
    let (qp, _ctx) = fixture.qp();
    assert!(matches!(
        qp.to_init(3, 0, full_access()),
        Err(Error::InvalidArg(_))
    ));
    assert!(matches!(
        qp.to_init(PORT_NUM, 5, full_access()),
        Err(Error::InvalidArg(_))
    ));
    assert_eq!(qp.state(), QpState::Reset);
}

#[test]
fn zero_dgid_rejected() {
    let fixture = Fixture::new();
    let (qp, _ctx) = fixture.qp();
    qp.to_init(PORT_NUM, 0, full_access()).unwrap();
    assert!(matches!(
        qp.to_rtr(42, 0, Gid::default(), Mtu::Mtu4096),
        Err(Error::InvalidArg(_))
    ));
    assert_eq!(qp.state(), QpState::Init);
}

#[test]
fn transition_to_reset_unsupported() {
    let fixture = Fixture::new();
    let (qp, _ctx) = fixture.qp();
    qp.to_init(PORT_NUM, 0, full_access()).unwrap();
    let attr = QpAttr {
        qp_state: QpState::Reset,
        ..Default::default()
    };
    assert!(matches!(
        qp.modify(&attr, QpAttrMask::STATE),
        Err(Error::InvalidArg(_))
    ));
    assert_eq!(qp.state(), QpState::Init);
}

#[test]
fn error_reachable_from_any_state_and_terminal() {
    let fixture = Fixture::new();
    let (qp, _ctx) = fixture.qp();
    let error_attr = QpAttr {
        qp_state: QpState::Error,
        ..Default::default()
    };
    qp.modify(&error_attr, QpAttrMask::STATE).expect("to error");
    assert_eq!(qp.state(), QpState::Error);

    // Posts fail immediately once in ERROR.
    let err = qp.post_recv(&[RecvWr::new(1)]).unwrap_err();
    match err {
        Error::Post { index, reason, .. } => {
            assert_eq!(index, 0);
            assert!(matches!(*reason, Error::State { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    let err = qp.post_send(&[SendWr::new(1, WrOpcode::Send)]).unwrap_err();
    assert!(matches!(err, Error::Post { .. }));
}

#[test]
fn entering_error_flushes_posted_receives() {
    let pair = connect_pair(&QpInitAttr::default());
    let mr = pair
        .pd
        .reg_mr_owned(vec![0u8; 256], full_access())
        .unwrap();
    pair.qp1
        .post_recv(&[RecvWr::new(5).sg(mr.sge(0, 256))])
        .unwrap();

    let error_attr = QpAttr {
        qp_state: QpState::Error,
        ..Default::default()
    };
    pair.qp1.modify(&error_attr, QpAttrMask::STATE).unwrap();

    let wcs = poll_n(&pair.cq1, 1);
    assert_eq!(wcs[0].wr_id(), 5);
    assert_eq!(wcs[0].status(), WcStatus::WrFlushErr);
    assert_eq!(wcs[0].qp_num(), pair.qp1.qp_num());
}

#[test]
fn destroy_flushes_posted_receives() {
    let pair = connect_pair(&QpInitAttr::default());
    let mr = pair
        .pd
        .reg_mr_owned(vec![0u8; 256], full_access())
        .unwrap();
    pair.qp1
        .post_recv(&[RecvWr::new(11).sg(mr.sge(0, 256))])
        .unwrap();

    let cq1 = std::sync::Arc::clone(&pair.cq1);
    drop(pair.qp1);

    let wcs = poll_n(&cq1, 1);
    assert_eq!(wcs[0].wr_id(), 11);
    assert_eq!(wcs[0].status(), WcStatus::WrFlushErr);
}

#[test]
fn query_reflects_committed_attributes() {
    let fixture = Fixture::new();
    let (qp, ctx) = fixture.qp();
    let dgid = ctx.query_gid(PORT_NUM, 0).unwrap();
    qp.to_init(PORT_NUM, 0, full_access()).unwrap();
    qp.to_rtr(42, 100, dgid, Mtu::Mtu4096).unwrap();

    let (attr, init) = qp.query().expect("query");
    assert_eq!(attr.qp_state, QpState::Rtr);
    assert_eq!(attr.dest_qp_num, 42);
    assert_eq!(attr.rq_psn, 100);
    assert_eq!(attr.path_mtu, Mtu::Mtu4096);
    assert_eq!(attr.port_num, PORT_NUM);
    assert_eq!(init.max_send_wr, 16);
}

#[test]
fn recv_can_be_preposted_from_init() {
    let fixture = Fixture::new();
    let (qp, _ctx) = fixture.qp();
    let pd = qp.pd().clone();
    let mr = pd.reg_mr_owned(vec![0u8; 64], full_access()).unwrap();

    // RESET rejects receives.
    assert!(matches!(
        qp.post_recv(&[RecvWr::new(1).sg(mr.sge(0, 64))]),
        Err(Error::Post { .. })
    ));

    qp.to_init(PORT_NUM, 0, full_access()).unwrap();
    qp.post_recv(&[RecvWr::new(2).sg(mr.sge(0, 64))])
        .expect("pre-post from INIT");
}

#[test]
fn destroy_from_any_state_is_permitted() {
    let fixture = Fixture::new();
    // RESET.
    let (qp, _) = fixture.qp();
    drop(qp);
    // INIT.
    let (qp, _) = fixture.qp();
    qp.to_init(PORT_NUM, 0, full_access()).unwrap();
    drop(qp);
    // ERROR.
    let (qp, _) = fixture.qp();
    qp.modify(
        &QpAttr {
            qp_state: QpState::Error,
            ..Default::default()
        },
        QpAttrMask::STATE,
    )
    .unwrap();
    drop(qp);
}
