//! Integration tests for the bluerdma adapter.
//!
//! Every test builds its own `DeviceRegistry`, so tests are independent
//! and run in parallel. The data-path tests drive pairs of connected QPs
//! on one device through the soft engine.

#[cfg(test)]
mod util {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use bluerdma::cq::CompletionQueue;
    use bluerdma::device::{Context, DeviceConfig, DeviceRegistry, Mtu, PORT_NUM};
    use bluerdma::mr::AccessFlags;
    use bluerdma::pd::ProtectionDomain;
    use bluerdma::qp::{QpInitAttr, QueuePair};
    use bluerdma::wc::WorkCompletion;

    pub fn full_access() -> AccessFlags {
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ
    }

    /// A pair of QPs on one device, connected to each other, each with its
    /// own CQ for both send and receive completions.
    pub struct LoopbackPair {
        pub qp0: QueuePair,
        pub qp1: QueuePair,
        pub cq0: Arc<CompletionQueue>,
        pub cq1: Arc<CompletionQueue>,
        pub pd: Arc<ProtectionDomain>,
        pub ctx: Arc<Context>,
        pub registry: DeviceRegistry,
    }

    pub fn connect_pair(init_attr: &QpInitAttr) -> LoopbackPair {
        let registry = DeviceRegistry::new(1, DeviceConfig::default()).expect("registry");
        let ctx = registry.first().expect("device").open().expect("open");
        let pd = ctx.alloc_pd().expect("alloc_pd");
        let cq0 = ctx.create_cq(64).expect("create_cq");
        let cq1 = ctx.create_cq(64).expect("create_cq");
        let qp0 = pd.create_qp(&cq0, &cq0, init_attr).expect("create_qp");
        let qp1 = pd.create_qp(&cq1, &cq1, init_attr).expect("create_qp");

        let dgid = ctx.query_gid(PORT_NUM, 0).expect("query_gid");
        for (qp, peer) in [(&qp0, qp1.qp_num()), (&qp1, qp0.qp_num())] {
            qp.to_init(PORT_NUM, 0, full_access()).expect("to_init");
            qp.to_rtr(peer, 0, dgid, Mtu::Mtu4096).expect("to_rtr");
            qp.to_rts(0).expect("to_rts");
        }

        LoopbackPair {
            qp0,
            qp1,
            cq0,
            cq1,
            pd,
            ctx,
            registry,
        }
    }

    /// Poll until `n` completions have been drained or two seconds pass.
    pub fn poll_n(cq: &CompletionQueue, n: usize) -> Vec<WorkCompletion> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut out = Vec::with_capacity(n);
        let mut buf = [WorkCompletion::default(); 8];
        while out.len() < n {
            let got = cq.poll(&mut buf).expect("poll");
            out.extend_from_slice(&buf[..got]);
            if got == 0 {
                assert!(Instant::now() < deadline, "timed out waiting for {n} completions");
                std::thread::yield_now();
            }
        }
        out
    }

    /// Assert the CQ stays empty.
    pub fn assert_empty(cq: &CompletionQueue) {
        let mut buf = [WorkCompletion::default(); 8];
        assert_eq!(cq.poll(&mut buf).expect("poll"), 0);
    }
}

#[cfg(test)]
mod device_tests;


#[cfg(test)]
mod qp_tests;



#[cfg(test)]
mod async_cq_tests;
