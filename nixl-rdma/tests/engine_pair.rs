//! Two in-process agents exercising the full transfer lifecycle: connection
//! bootstrap, metadata exchange, one-sided reads/writes, notifications, and
//! the progress thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nixl_core::{
    BackendEngine, BackendParams, EngineError, MemKind, MetaDesc, MetaDescList, RegDesc,
    Registration, XferHandle, XferOp, XferOptions, XferStatus,
};
use nixl_rdma::{DevicePtrInfo, DeviceQuery, RdmaEngine};

fn engine(name: &str) -> RdmaEngine {
    RdmaEngine::new(&BackendParams::new(name)).expect("engine construction")
}

fn engine_with(params: BackendParams) -> RdmaEngine {
    RdmaEngine::new(&params).expect("engine construction")
}

/// Loads connection info in both directions and runs the liveness checks.
fn link(a: &RdmaEngine, a_name: &str, b: &RdmaEngine, b_name: &str) {
    a.load_remote_connection_info(b_name, &b.connection_info().unwrap())
        .unwrap();
    b.load_remote_connection_info(a_name, &a.connection_info().unwrap())
        .unwrap();
    a.connect(b_name).unwrap();
    b.connect(a_name).unwrap();
}

fn register(engine: &RdmaEngine, buf: &[u8]) -> Registration {
    engine
        .register_memory(
            &RegDesc::new(buf.as_ptr() as u64, buf.len() as u64, 0),
            MemKind::HostDram,
        )
        .expect("register")
}

fn import(
    importer: &RdmaEngine,
    owner: &RdmaEngine,
    owner_name: &str,
    reg: &Registration,
) -> Registration {
    let blob = owner.public_metadata(reg).unwrap();
    importer
        .load_remote_metadata(&blob, MemKind::HostDram, owner_name)
        .unwrap()
}

fn single_desc(kind: MemKind, addr: u64, len: u64, meta: Registration) -> MetaDescList {
    let mut list = MetaDescList::new(kind);
    list.push(MetaDesc::new(addr, len, 0, meta));
    list
}

fn poll_done(engine: &RdmaEngine, handle: &mut XferHandle) {
    for _ in 0..1000 {
        match engine.check_transfer(handle).expect("check") {
            XferStatus::Done => return,
            XferStatus::InProgress => {}
        }
    }
    panic!("transfer did not complete");
}

const N: usize = 4096;

#[test]
fn write_places_bytes_at_remote_offset() {
    let a = engine("agent-a");
    let b = engine("agent-b");
    link(&a, "agent-a", &b, "agent-b");

    let mut buf_a = vec![0xbb_u8; N];
    buf_a[..N / 2].fill(0xda);
    let buf_b = vec![0xbb_u8; N];

    let reg_a = register(&a, &buf_a);
    let reg_b = register(&b, &buf_b);
    let remote_b = import(&a, &b, "agent-b", &reg_b);

    let local = single_desc(MemKind::HostDram, buf_a.as_ptr() as u64, (N / 2) as u64, reg_a);
    let remote = single_desc(
        MemKind::HostDram,
        buf_b.as_ptr() as u64,
        (N / 2) as u64,
        remote_b,
    );

    let mut handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "agent-b")
        .unwrap();
    a.post_transfer(
        XferOp::Write,
        &local,
        &remote,
        "agent-b",
        &mut handle,
        &XferOptions::default(),
    )
    .unwrap();
    poll_done(&a, &mut handle);
    a.release_transfer(handle).unwrap();

    assert!(buf_b[..N / 2].iter().all(|&byte| byte == 0xda));
    assert!(buf_b[N / 2..].iter().all(|&byte| byte == 0xbb));
}

#[test]
fn read_pulls_remote_bytes() {
    let a = engine("read-a");
    let b = engine("read-b");
    link(&a, "read-a", &b, "read-b");

    let buf_a = vec![0_u8; N];
    let mut buf_b = vec![0xbb_u8; N];
    buf_b[N / 3..].fill(0xda);

    let reg_a = register(&a, &buf_a);
    let reg_b = register(&b, &buf_b);
    let remote_b = import(&a, &b, "read-b", &reg_b);

    let local = single_desc(MemKind::HostDram, buf_a.as_ptr() as u64, N as u64, reg_a);
    let remote = single_desc(MemKind::HostDram, buf_b.as_ptr() as u64, N as u64, remote_b);

    let mut handle = a
        .prep_transfer(XferOp::Read, &local, &remote, "read-b")
        .unwrap();
    a.post_transfer(
        XferOp::Read,
        &local,
        &remote,
        "read-b",
        &mut handle,
        &XferOptions::default(),
    )
    .unwrap();
    poll_done(&a, &mut handle);
    a.release_transfer(handle).unwrap();

    assert_eq!(buf_a, buf_b);
}

#[test]
fn multi_descriptor_transfer_moves_every_pair() {
    let a = engine_with(BackendParams::new("multi-a").with_workers(2));
    let b = engine_with(BackendParams::new("multi-b").with_workers(2));
    link(&a, "multi-a", &b, "multi-b");

    let buf_a = vec![0x21_u8; 3 * 1024];
    let buf_b = vec![0_u8; 3 * 1024];
    let reg_a = register(&a, &buf_a);
    let reg_b = register(&b, &buf_b);
    let remote_b = import(&a, &b, "multi-b", &reg_b);

    let mut local = MetaDescList::new(MemKind::HostDram);
    let mut remote = MetaDescList::new(MemKind::HostDram);
    for chunk in 0..3 {
        let offset = (chunk * 1024) as u64;
        local.push(MetaDesc::new(
            buf_a.as_ptr() as u64 + offset,
            1024,
            0,
            reg_a.clone(),
        ));
        remote.push(MetaDesc::new(
            buf_b.as_ptr() as u64 + offset,
            1024,
            0,
            remote_b.clone(),
        ));
    }

    let mut handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "multi-b")
        .unwrap();
    a.post_transfer(
        XferOp::Write,
        &local,
        &remote,
        "multi-b",
        &mut handle,
        &XferOptions::default(),
    )
    .unwrap();
    poll_done(&a, &mut handle);
    a.release_transfer(handle).unwrap();

    assert_eq!(buf_b, buf_a);
}

#[test]
fn notification_arrives_exactly_once_in_order() {
    let a = engine("notif-a");
    let b = engine("notif-b");
    link(&a, "notif-a", &b, "notif-b");

    let buf_a = vec![7_u8; 1024];
    let buf_b = vec![0_u8; 1024];
    let reg_a = register(&a, &buf_a);
    let reg_b = register(&b, &buf_b);
    let remote_b = import(&a, &b, "notif-b", &reg_b);

    for round in 0..2_u8 {
        let local = single_desc(MemKind::HostDram, buf_a.as_ptr() as u64, 1024, reg_a.clone());
        let remote = single_desc(
            MemKind::HostDram,
            buf_b.as_ptr() as u64,
            1024,
            remote_b.clone(),
        );
        let mut handle = a
            .prep_transfer(XferOp::Write, &local, &remote, "notif-b")
            .unwrap();
        a.post_transfer(
            XferOp::Write,
            &local,
            &remote,
            "notif-b",
            &mut handle,
            &XferOptions::with_notification(vec![round]),
        )
        .unwrap();
        poll_done(&a, &mut handle);
        a.release_transfer(handle).unwrap();
    }

    let mut notifs = Vec::new();
    b.get_notifications(&mut notifs).unwrap();
    assert_eq!(notifs.len(), 2);
    assert!(notifs.iter().all(|notif| notif.agent == "notif-a"));
    assert_eq!(notifs[0].payload, vec![0]);
    assert_eq!(notifs[1].payload, vec![1]);

    // Already drained; the data behind the notification is visible.
    let mut again = Vec::new();
    b.get_notifications(&mut again).unwrap();
    assert!(again.is_empty());
    assert_eq!(buf_b, buf_a);
}

#[test]
fn get_notifications_requires_empty_list() {
    let a = engine("drain-a");
    let mut non_empty = vec![nixl_core::Notification {
        agent: "x".into(),
        payload: Vec::new(),
    }];
    assert!(matches!(
        a.get_notifications(&mut non_empty),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn pair_length_mismatch_is_rejected() {
    let a = engine("len-a");
    let b = engine("len-b");
    link(&a, "len-a", &b, "len-b");

    let buf_a = vec![0_u8; 1024];
    let buf_b = vec![0_u8; 1024];
    let reg_a = register(&a, &buf_a);
    let reg_b = register(&b, &buf_b);
    let remote_b = import(&a, &b, "len-b", &reg_b);

    let local = single_desc(MemKind::HostDram, buf_a.as_ptr() as u64, 1024, reg_a);
    let remote = single_desc(MemKind::HostDram, buf_b.as_ptr() as u64, 512, remote_b);

    let mut handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "len-b")
        .unwrap();
    let err = a
        .post_transfer(
            XferOp::Write,
            &local,
            &remote,
            "len-b",
            &mut handle,
            &XferOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    a.release_transfer(handle).unwrap();
}

#[test]
fn descriptor_count_mismatch_is_rejected() {
    let a = engine("cnt-a");
    let b = engine("cnt-b");
    link(&a, "cnt-a", &b, "cnt-b");

    let buf = vec![0_u8; 1024];
    let reg = register(&a, &buf);
    let local = single_desc(MemKind::HostDram, buf.as_ptr() as u64, 1024, reg);
    let remote = MetaDescList::new(MemKind::HostDram);

    let mut handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "cnt-b")
        .unwrap();
    assert!(matches!(
        a.post_transfer(
            XferOp::Write,
            &local,
            &remote,
            "cnt-b",
            &mut handle,
            &XferOptions::default(),
        ),
        Err(EngineError::InvalidArgument(_))
    ));
    a.release_transfer(handle).unwrap();
}

#[test]
fn unsupported_kinds_are_gated_at_prep() {
    let a = engine("kind-a");
    let buf = vec![0_u8; 64];
    let reg = register(&a, &buf);

    let local = single_desc(MemKind::HostDram, buf.as_ptr() as u64, 64, reg.clone());
    let remote = single_desc(MemKind::Object, 0, 64, reg);

    assert!(matches!(
        a.prep_transfer(XferOp::Write, &local, &remote, "kind-a"),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn release_is_safe_before_post_and_mid_flight() {
    let a = engine("rel-a");
    let b = engine("rel-b");
    link(&a, "rel-a", &b, "rel-b");

    let buf_a = vec![0x44_u8; 2048];
    let buf_b = vec![0_u8; 2048];
    let reg_a = register(&a, &buf_a);
    let reg_b = register(&b, &buf_b);
    let remote_b = import(&a, &b, "rel-b", &reg_b);

    let local = single_desc(MemKind::HostDram, buf_a.as_ptr() as u64, 2048, reg_a);
    let remote = single_desc(MemKind::HostDram, buf_b.as_ptr() as u64, 2048, remote_b);

    // Release before post.
    let handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "rel-b")
        .unwrap();
    a.release_transfer(handle).unwrap();

    // Release mid-flight cancels the queued copy; the target stays clean.
    let mut handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "rel-b")
        .unwrap();
    a.post_transfer(
        XferOp::Write,
        &local,
        &remote,
        "rel-b",
        &mut handle,
        &XferOptions::default(),
    )
    .unwrap();
    a.release_transfer(handle).unwrap();
    assert!(buf_b.iter().all(|&byte| byte == 0));
}

#[test]
fn check_stays_done_after_completion() {
    let a = engine("mono-a");
    let b = engine("mono-b");
    link(&a, "mono-a", &b, "mono-b");

    let buf_a = vec![1_u8; 1024];
    let buf_b = vec![0_u8; 1024];
    let reg_a = register(&a, &buf_a);
    let reg_b = register(&b, &buf_b);
    let remote_b = import(&a, &b, "mono-b", &reg_b);

    let local = single_desc(MemKind::HostDram, buf_a.as_ptr() as u64, 1024, reg_a);
    let remote = single_desc(MemKind::HostDram, buf_b.as_ptr() as u64, 1024, remote_b);

    let mut handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "mono-b")
        .unwrap();
    a.post_transfer(
        XferOp::Write,
        &local,
        &remote,
        "mono-b",
        &mut handle,
        &XferOptions::default(),
    )
    .unwrap();
    poll_done(&a, &mut handle);
    for _ in 0..4 {
        assert_eq!(a.check_transfer(&mut handle).unwrap(), XferStatus::Done);
    }
    a.release_transfer(handle).unwrap();
}

#[test]
fn handle_cannot_be_posted_twice() {
    let a = engine("twice-a");
    let b = engine("twice-b");
    link(&a, "twice-a", &b, "twice-b");

    let buf_a = vec![1_u8; 512];
    let buf_b = vec![0_u8; 512];
    let reg_a = register(&a, &buf_a);
    let reg_b = register(&b, &buf_b);
    let remote_b = import(&a, &b, "twice-b", &reg_b);

    let local = single_desc(MemKind::HostDram, buf_a.as_ptr() as u64, 512, reg_a);
    let remote = single_desc(MemKind::HostDram, buf_b.as_ptr() as u64, 512, remote_b);

    let mut handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "twice-b")
        .unwrap();
    a.post_transfer(
        XferOp::Write,
        &local,
        &remote,
        "twice-b",
        &mut handle,
        &XferOptions::default(),
    )
    .unwrap();
    assert!(matches!(
        a.post_transfer(
            XferOp::Write,
            &local,
            &remote,
            "twice-b",
            &mut handle,
            &XferOptions::default(),
        ),
        Err(EngineError::InvalidArgument(_))
    ));
    poll_done(&a, &mut handle);
    a.release_transfer(handle).unwrap();
}

#[test]
fn unknown_agents_report_not_found() {
    let a = engine("lost-a");
    assert!(matches!(
        a.connect("nobody"),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        a.disconnect("nobody"),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        a.load_remote_metadata(&[0_u8; 16], MemKind::HostDram, "nobody"),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn self_transfer_through_local_metadata() {
    let a = engine("loop-a");
    a.connect("loop-a").unwrap();

    let src = vec![0x77_u8; 1024];
    let dst = vec![0_u8; 1024];
    let reg_src = register(&a, &src);
    let reg_dst = register(&a, &dst);
    let dst_md = a.load_local_metadata(&reg_dst).unwrap();

    let local = single_desc(MemKind::HostDram, src.as_ptr() as u64, 1024, reg_src);
    let remote = single_desc(MemKind::HostDram, dst.as_ptr() as u64, 1024, dst_md);

    let mut handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "loop-a")
        .unwrap();
    a.post_transfer(
        XferOp::Write,
        &local,
        &remote,
        "loop-a",
        &mut handle,
        &XferOptions::default(),
    )
    .unwrap();
    poll_done(&a, &mut handle);
    a.release_transfer(handle).unwrap();

    assert_eq!(dst, src);
}

#[test]
fn disconnect_tears_down_and_allows_reload() {
    let a = engine("cycle-a");
    let b = engine("cycle-b");
    link(&a, "cycle-a", &b, "cycle-b");

    a.disconnect("cycle-b").unwrap();
    assert!(matches!(
        a.load_remote_metadata(&[0_u8; 16], MemKind::HostDram, "cycle-b"),
        Err(EngineError::NotFound(_))
    ));

    // The agent can be loaded again after teardown.
    a.load_remote_connection_info("cycle-b", &b.connection_info().unwrap())
        .unwrap();
    a.connect("cycle-b").unwrap();
}

#[test]
fn capabilities_are_stable() {
    let a = engine("caps-a");
    for _ in 0..2 {
        assert!(a.supports_remote());
        assert!(a.supports_local());
        assert!(a.supports_notifications());
        assert!(a.supports_progress_thread());
        let kinds = a.supported_memory_kinds();
        assert!(kinds.contains(&MemKind::HostDram));
        assert!(kinds.contains(&MemKind::DeviceDram));
        assert!(!kinds.contains(&MemKind::Object));
    }
}

#[test]
fn zero_workers_is_a_construction_error() {
    let err = RdmaEngine::new(&BackendParams::new("none").with_workers(0)).unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[test]
fn progress_thread_drives_transfers_and_notifications() {
    let a = engine_with(BackendParams::new("pth-a").with_progress_thread(2));
    let b = engine_with(BackendParams::new("pth-b").with_progress_thread(2));
    link(&a, "pth-a", &b, "pth-b");

    let buf_a = vec![0x3c_u8; 2048];
    let buf_b = vec![0_u8; 2048];
    let reg_a = register(&a, &buf_a);
    let reg_b = register(&b, &buf_b);
    let remote_b = import(&a, &b, "pth-b", &reg_b);

    let local = single_desc(MemKind::HostDram, buf_a.as_ptr() as u64, 2048, reg_a);
    let remote = single_desc(MemKind::HostDram, buf_b.as_ptr() as u64, 2048, remote_b);

    let mut handle = a
        .prep_transfer(XferOp::Write, &local, &remote, "pth-b")
        .unwrap();
    a.post_transfer(
        XferOp::Write,
        &local,
        &remote,
        "pth-b",
        &mut handle,
        &XferOptions::with_notification(b"flushed".to_vec()),
    )
    .unwrap();
    poll_done(&a, &mut handle);
    a.release_transfer(handle).unwrap();

    // The receiver's progress thread delivers the message; the caller only
    // drains.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut notifs = Vec::new();
    while notifs.is_empty() {
        b.get_notifications(&mut notifs).unwrap();
        if notifs.is_empty() {
            assert!(Instant::now() < deadline, "notification never arrived");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    assert_eq!(notifs.len(), 1);
    assert_eq!(notifs[0].agent, "pth-a");
    assert_eq!(notifs[0].payload, b"flushed".to_vec());
    assert_eq!(buf_b, buf_a);
}

struct OneDeviceQuery {
    base: u64,
    len: u64,
}

impl DeviceQuery for OneDeviceQuery {
    fn query(&self, addr: u64) -> Option<DevicePtrInfo> {
        (addr >= self.base && addr < self.base + self.len).then_some(DevicePtrInfo {
            device: 0,
            context: 0xc0de,
        })
    }
}

#[test]
fn device_registration_restarts_progress_thread() {
    let dev_buf = vec![0_u8; 1024];
    let query = Arc::new(OneDeviceQuery {
        base: dev_buf.as_ptr() as u64,
        len: 1024,
    });
    let a = RdmaEngine::with_device_query(
        &BackendParams::new("vram-a").with_progress_thread(2),
        query,
    )
    .unwrap();

    let reg = a
        .register_memory(
            &RegDesc::new(dev_buf.as_ptr() as u64, 1024, 0),
            MemKind::DeviceDram,
        )
        .unwrap();

    // The engine keeps functioning after the context-inheriting restart.
    a.connect("vram-a").unwrap();
    let md = a.load_local_metadata(&reg).unwrap();
    drop(md);
    a.deregister_memory(reg).unwrap();
}
