use fsgate_core::action::{RuleMajor, RuleMinor};
use fsgate_core::record::{set_info, FileRef, OpMajor};
use fsgate_core::rule::Rule;
use fsgate_core::status::OpStatus;
use intercept::{
    CreateFlags, CreateRequest, HostOps, Pipeline, PostOutcome, PreDecision, Requestor,
    SetInfoOp, SetInfoRequest, StreamId, WriteRequest,
};
use monitor::RecordQueue;
use rules::RuleStore;
use std::sync::{Arc, Mutex};

struct FakeHost {
    fail_resolve: Option<OpStatus>,
    fail_file_ref: Option<OpStatus>,
    cancelled: Arc<Mutex<Vec<StreamId>>>,
}

impl FakeHost {
    fn ok() -> Self {
        FakeHost { fail_resolve: None, fail_file_ref: None, cancelled: Arc::default() }
    }
}

impl HostOps for FakeHost {
    fn resolve_name(&self, _stream: StreamId, raw: &str) -> Result<String, OpStatus> {
        match self.fail_resolve {
            Some(status) => Err(status),
            None => Ok(raw.to_string()),
        }
    }

    fn resolve_rename_target(&self, _stream: StreamId, target: &str) -> Result<String, OpStatus> {
        Ok(target.to_string())
    }

    fn file_reference(&self, _stream: StreamId) -> Result<FileRef, OpStatus> {
        match self.fail_file_ref {
            Some(status) => Err(status),
            None => Ok(FileRef { volume_serial: 7, file_id: [1u8; 16] }),
        }
    }

    fn cancel_open(&self, stream: StreamId) {
        self.cancelled.lock().unwrap().push(stream);
    }
}

fn setup(rules: &[(RuleMajor, RuleMinor, &str)]) -> (Arc<RuleStore>, Arc<RecordQueue>) {
    let store = Arc::new(RuleStore::new());
    for (major, minor, pattern) in rules {
        store.add(&[Rule::new(*major, *minor, *pattern).unwrap()]).unwrap();
    }
    (store, Arc::new(RecordQueue::new(1024)))
}

fn drain(queue: &RecordQueue) -> Vec<fsgate_core::record::MonitorRecord> {
    let mut body = Vec::new();
    queue.fill_frame(&mut body);
    wire::decode_frame(&body).unwrap()
}

fn create_req(stream: u64, name: &str) -> CreateRequest<'_> {
    CreateRequest {
        stream: StreamId(stream),
        requestor: Requestor { pid: 100, tid: 200 },
        name,
        flags: CreateFlags::default(),
    }
}

fn open_readonly(pipeline: &Pipeline<FakeHost>, stream: u64, name: &str) {
    let token = match pipeline.pre_create(&create_req(stream, name)) {
        PreDecision::AllowWithPost(token) => token,
        other => panic!("expected post callback, got {other:?}"),
    };
    assert_eq!(
        pipeline.post_create(StreamId(stream), OpStatus::SUCCESS, token, false),
        PostOutcome::Attached
    );
}

#[test]
fn denied_open_completes_with_access_denied_and_no_record() {
    let (store, queue) =
        setup(&[(RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\HARDDISKVOLUME1\SECRETS\*")]);
    let pipeline = Pipeline::new(store, Arc::clone(&queue), FakeHost::ok());

    match pipeline.pre_create(&create_req(1, r"\Device\HarddiskVolume1\secrets\a.txt")) {
        PreDecision::Complete(status) => assert_eq!(status, OpStatus::ACCESS_DENIED),
        other => panic!("expected denial, got {other:?}"),
    }
    assert!(drain(&queue).is_empty());

    // Unmatched path passes with no post callback and no record.
    assert!(matches!(
        pipeline.pre_create(&create_req(2, r"\Device\HarddiskVolume1\public\a.txt")),
        PreDecision::Allow
    ));
    assert!(drain(&queue).is_empty());
}

#[test]
fn monitored_denied_open_emits_one_record() {
    let (store, queue) = setup(&[(
        RuleMajor::AccessDenied,
        RuleMinor::Monitored,
        r"\DEVICE\HARDDISKVOLUME1\SECRETS\*",
    )]);
    let pipeline = Pipeline::new(store, Arc::clone(&queue), FakeHost::ok());

    let path = r"\Device\HarddiskVolume1\secrets\a.txt";
    assert!(matches!(pipeline.pre_create(&create_req(1, path)), PreDecision::Complete(_)));

    let records = drain(&queue);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].major_fn, OpMajor::Create);
    assert_eq!(records[0].op_status, OpStatus::ACCESS_DENIED);
    assert_eq!(records[0].file_path, path);
}

#[test]
fn readonly_open_succeeds_then_write_is_denied_and_recorded() {
    let (store, queue) = setup(&[(
        RuleMajor::ReadOnly,
        RuleMinor::Monitored,
        r"\DEVICE\HARDDISKVOLUME1\SECRETS\*",
    )]);
    let pipeline = Pipeline::new(store, Arc::clone(&queue), FakeHost::ok());

    open_readonly(&pipeline, 1, r"\Device\HarddiskVolume1\secrets\a.txt");
    assert_eq!(
        pipeline.classification(StreamId(1)),
        Some((RuleMajor::ReadOnly, RuleMinor::Monitored))
    );

    let write = WriteRequest { stream: StreamId(1), requestor: Requestor { pid: 5, tid: 6 } };
    match pipeline.pre_write(&write) {
        PreDecision::Complete(status) => assert_eq!(status, OpStatus::ACCESS_DENIED),
        other => panic!("expected write denial, got {other:?}"),
    }

    let records = drain(&queue);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].major_fn, OpMajor::Write);
    assert_eq!(records[0].rule_pattern, r"\DEVICE\HARDDISKVOLUME1\SECRETS\*");
    assert_eq!(records[0].file.volume_serial, 7);
    assert_eq!(records[0].pid, 5);
}

#[test]
fn classification_is_fixed_at_open_time() {
    let (store, queue) =
        setup(&[(RuleMajor::ReadOnly, RuleMinor::Monitored, r"\DEVICE\HD1\LOCKED\*")]);
    let pipeline = Pipeline::new(Arc::clone(&store), Arc::clone(&queue), FakeHost::ok());

    open_readonly(&pipeline, 1, r"\Device\HD1\Locked\f.txt");
    let before = pipeline.classification(StreamId(1));

    // Rule changes after open must not reclassify the live stream.
    store.cleanup().unwrap();
    assert_eq!(pipeline.classification(StreamId(1)), before);
    assert!(matches!(
        pipeline.pre_write(&WriteRequest { stream: StreamId(1), requestor: Requestor::default() }),
        PreDecision::Complete(_)
    ));
}

#[test]
fn raced_posts_keep_first_classification() {
    let (store, queue) =
        setup(&[(RuleMajor::ReadOnly, RuleMinor::Monitored, r"\DEVICE\HD1\LOCKED\*")]);
    let pipeline = Pipeline::new(Arc::clone(&store), queue, FakeHost::ok());

    let name = r"\Device\HD1\Locked\f.txt";
    let first = match pipeline.pre_create(&create_req(1, name)) {
        PreDecision::AllowWithPost(token) => token,
        other => panic!("expected post, got {other:?}"),
    };
    // A second open of the same stream races through pre while the store
    // now classifies it differently.
    store.cleanup().unwrap();
    store
        .add(&[Rule::new(RuleMajor::ReadOnly, RuleMinor::None, r"\DEVICE\HD1\LOCKED\*").unwrap()])
        .unwrap();
    let second = match pipeline.pre_create(&create_req(1, name)) {
        PreDecision::AllowWithPost(token) => token,
        other => panic!("expected post, got {other:?}"),
    };

    assert_eq!(
        pipeline.post_create(StreamId(1), OpStatus::SUCCESS, first, false),
        PostOutcome::Attached
    );
    assert_eq!(
        pipeline.post_create(StreamId(1), OpStatus::SUCCESS, second, false),
        PostOutcome::Attached
    );
    assert_eq!(
        pipeline.classification(StreamId(1)),
        Some((RuleMajor::ReadOnly, RuleMinor::Monitored))
    );
}

#[test]
fn exempt_opens_and_volume_roots_pass_through() {
    let (store, queue) = setup(&[(RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\*")]);
    let pipeline = Pipeline::new(store, queue, FakeHost::ok());

    for flags in [
        CreateFlags { paging_file: true, ..CreateFlags::default() },
        CreateFlags { volume_open: true, ..CreateFlags::default() },
        CreateFlags { open_by_file_id: true, ..CreateFlags::default() },
        CreateFlags { rename_target_probe: true, ..CreateFlags::default() },
    ] {
        let req = CreateRequest {
            stream: StreamId(1),
            requestor: Requestor::default(),
            name: r"\Device\HD1\anything",
            flags,
        };
        assert!(matches!(pipeline.pre_create(&req), PreDecision::Allow));
    }

    // Volume-root path: empty final component.
    assert!(matches!(
        pipeline.pre_create(&create_req(2, r"\Device\HarddiskVolume1\")),
        PreDecision::Allow
    ));
}

#[test]
fn name_resolution_failure_propagates() {
    let (store, queue) = setup(&[]);
    let host = FakeHost { fail_resolve: Some(OpStatus::NOT_FOUND), ..FakeHost::ok() };
    let pipeline = Pipeline::new(store, queue, host);
    match pipeline.pre_create(&create_req(1, r"\Device\HD1\x")) {
        PreDecision::Complete(status) => assert_eq!(status, OpStatus::NOT_FOUND),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn failed_context_attach_cancels_the_open() {
    let (store, queue) =
        setup(&[(RuleMajor::ReadOnly, RuleMinor::None, r"\DEVICE\HD1\LOCKED\*")]);
    let cancelled = Arc::new(Mutex::new(Vec::new()));
    let host = FakeHost {
        fail_resolve: None,
        fail_file_ref: Some(OpStatus::INSUFFICIENT_RESOURCES),
        cancelled: Arc::clone(&cancelled),
    };
    let pipeline = Pipeline::new(store, queue, host);

    let token = match pipeline.pre_create(&create_req(9, r"\Device\HD1\Locked\f.txt")) {
        PreDecision::AllowWithPost(token) => token,
        other => panic!("expected post, got {other:?}"),
    };
    assert_eq!(
        pipeline.post_create(StreamId(9), OpStatus::SUCCESS, token, false),
        PostOutcome::Cancelled(OpStatus::INSUFFICIENT_RESOURCES)
    );
    assert_eq!(*cancelled.lock().unwrap(), vec![StreamId(9)]);
    assert_eq!(pipeline.classification(StreamId(9)), None);
}

#[test]
fn failed_open_skips_context_attach() {
    let (store, queue) =
        setup(&[(RuleMajor::ReadOnly, RuleMinor::None, r"\DEVICE\HD1\LOCKED\*")]);
    let pipeline = Pipeline::new(store, queue, FakeHost::ok());

    let token = match pipeline.pre_create(&create_req(3, r"\Device\HD1\Locked\f.txt")) {
        PreDecision::AllowWithPost(token) => token,
        other => panic!("expected post, got {other:?}"),
    };
    assert_eq!(
        pipeline.post_create(StreamId(3), OpStatus::NOT_FOUND, token, false),
        PostOutcome::Skipped
    );
    assert_eq!(pipeline.classification(StreamId(3)), None);
}

#[test]
fn delete_disposition_denied_on_readonly_stream() {
    let (store, queue) =
        setup(&[(RuleMajor::ReadOnly, RuleMinor::None, r"\DEVICE\HD1\LOCKED\*")]);
    let pipeline = Pipeline::new(store, queue, FakeHost::ok());

    open_readonly(&pipeline, 1, r"\Device\HD1\Locked\f.txt");
    let req = SetInfoRequest {
        stream: StreamId(1),
        requestor: Requestor::default(),
        name: r"\Device\HD1\Locked\f.txt",
        op: SetInfoOp::DeleteDisposition,
    };
    assert!(matches!(
        pipeline.pre_set_information(&req),
        PreDecision::Complete(OpStatus::ACCESS_DENIED)
    ));
}

#[test]
fn rename_to_denied_destination_records_both_paths() {
    let (store, queue) = setup(&[
        (RuleMajor::ReadOnly, RuleMinor::Monitored, r"\DEVICE\HD1\SRC\*"),
        (RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\HD1\BLOCKED\*"),
    ]);
    let pipeline = Pipeline::new(store, Arc::clone(&queue), FakeHost::ok());

    let src = r"\Device\HD1\Src\f.txt";
    open_readonly(&pipeline, 1, src);

    let dest = r"\Device\HD1\Blocked\f.txt";
    let req = SetInfoRequest {
        stream: StreamId(1),
        requestor: Requestor { pid: 42, tid: 43 },
        name: src,
        op: SetInfoOp::Rename { target: dest },
    };
    match pipeline.pre_set_information(&req) {
        PreDecision::Complete(status) => assert_eq!(status, OpStatus::ACCESS_DENIED),
        other => panic!("expected rename denial, got {other:?}"),
    }

    let records = drain(&queue);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].major_fn, OpMajor::SetInformation);
    assert_eq!(records[0].minor_fn, set_info::RENAME);
    assert_eq!(records[0].op_status, OpStatus::ACCESS_DENIED);
    assert_eq!(records[0].file_path, src);
    assert_eq!(records[0].rename_path.as_deref(), Some(dest));
    assert_eq!(records[0].rule_pattern, r"\DEVICE\HD1\BLOCKED\*");
}

#[test]
fn rename_of_monitored_stream_to_free_destination_is_allowed_but_recorded() {
    let (store, queue) =
        setup(&[(RuleMajor::ReadOnly, RuleMinor::Monitored, r"\DEVICE\HD1\SRC\*")]);
    let pipeline = Pipeline::new(store, Arc::clone(&queue), FakeHost::ok());

    open_readonly(&pipeline, 1, r"\Device\HD1\Src\f.txt");
    let req = SetInfoRequest {
        stream: StreamId(1),
        requestor: Requestor::default(),
        name: r"\Device\HD1\Src\f.txt",
        op: SetInfoOp::Rename { target: r"\Device\HD1\Other\f.txt" },
    };
    assert!(matches!(pipeline.pre_set_information(&req), PreDecision::Allow));

    let records = drain(&queue);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].op_status, OpStatus::SUCCESS);
    assert_eq!(records[0].rule_pattern, r"\DEVICE\HD1\SRC\*");
}

#[test]
fn other_set_information_kinds_pass_through() {
    let (store, queue) =
        setup(&[(RuleMajor::ReadOnly, RuleMinor::None, r"\DEVICE\HD1\LOCKED\*")]);
    let pipeline = Pipeline::new(store, queue, FakeHost::ok());
    open_readonly(&pipeline, 1, r"\Device\HD1\Locked\f.txt");
    let req = SetInfoRequest {
        stream: StreamId(1),
        requestor: Requestor::default(),
        name: r"\Device\HD1\Locked\f.txt",
        op: SetInfoOp::Other,
    };
    assert!(matches!(pipeline.pre_set_information(&req), PreDecision::Allow));
}

#[test]
fn cleanup_releases_the_context() {
    let (store, queue) =
        setup(&[(RuleMajor::ReadOnly, RuleMinor::None, r"\DEVICE\HD1\LOCKED\*")]);
    let pipeline = Pipeline::new(store, queue, FakeHost::ok());

    open_readonly(&pipeline, 1, r"\Device\HD1\Locked\f.txt");
    pipeline.cleanup(StreamId(1));
    assert_eq!(pipeline.classification(StreamId(1)), None);
    assert!(matches!(
        pipeline.pre_write(&WriteRequest { stream: StreamId(1), requestor: Requestor::default() }),
        PreDecision::Allow
    ));
}

#[test]
fn not_found_denial_variant_is_configurable() {
    let (store, queue) = setup(&[(
        RuleMajor::AccessDenied,
        RuleMinor::Monitored,
        r"\DEVICE\HD1\SECRETS\*",
    )]);
    let pipeline = Pipeline::new(store, Arc::clone(&queue), FakeHost::ok())
        .with_deny_open_status(OpStatus::NOT_FOUND);

    match pipeline.pre_create(&create_req(1, r"\Device\HD1\Secrets\a.txt")) {
        PreDecision::Complete(status) => assert_eq!(status, OpStatus::NOT_FOUND),
        other => panic!("expected denial, got {other:?}"),
    }
    // The record carries the deny status verbatim.
    assert_eq!(drain(&queue)[0].op_status, OpStatus::NOT_FOUND);
}
