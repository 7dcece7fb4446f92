//! Operation interception pipeline.
//!
//! Four operation kinds flow through here: open, write, set-information and
//! cleanup. Each pre callback returns a decision — let the operation
//! through, let it through and ask for a post callback, or complete it with
//! a status. The host's hook plumbing (dispatch, name resolution, open
//! cancellation) sits behind [`HostOps`]; the pipeline consults the rule
//! store on every relevant operation and attaches a per-open context to
//! streams classified read-only.
//!
//! A stream's classification is set exactly once, at the post-open of its
//! first successful open, and never changes afterwards — rule changes do not
//! reclassify live streams.

#![deny(unsafe_code)]

use dashmap::DashMap;
use fsgate_core::action::{RuleMajor, RuleMinor};
use fsgate_core::record::{set_info, FileRef, MonitorRecord, OpMajor};
use fsgate_core::status::OpStatus;
use fsgate_core::time::ticks_now;
use monitor::RecordQueue;
use rules::RuleStore;
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};

/// Host-assigned identity of one opened file stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Process and thread that requested the operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Requestor {
    /// Requestor process identifier.
    pub pid: u64,
    /// Requestor thread identifier.
    pub tid: u64,
}

/// Open-time flags the pipeline short-circuits on.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateFlags {
    /// Paging-file open.
    pub paging_file: bool,
    /// Open of the volume itself.
    pub volume_open: bool,
    /// Open by file id rather than by name.
    pub open_by_file_id: bool,
    /// Rename-target-probe open issued by the file system.
    pub rename_target_probe: bool,
}

impl CreateFlags {
    fn policy_exempt(self) -> bool {
        self.paging_file || self.volume_open || self.open_by_file_id || self.rename_target_probe
    }
}

/// Host plumbing the pipeline calls out to.
pub trait HostOps: Send + Sync {
    /// Resolve a raw open name to a normalized, device-rooted path.
    fn resolve_name(&self, stream: StreamId, raw: &str) -> Result<String, OpStatus>;

    /// Resolve a rename destination to a normalized, device-rooted path.
    fn resolve_rename_target(&self, stream: StreamId, target: &str) -> Result<String, OpStatus>;

    /// File identity copied into audit records, available once the open
    /// succeeded.
    fn file_reference(&self, stream: StreamId) -> Result<FileRef, OpStatus>;

    /// Abort a partially opened file so the caller never sees a handle
    /// without policy context.
    fn cancel_open(&self, stream: StreamId);
}

/// Outcome of a pre callback.
#[derive(Debug)]
pub enum PreDecision {
    /// Let the operation through; no post callback.
    Allow,
    /// Let the open through and call [`Pipeline::post_create`] with this
    /// token once the host knows the open's status.
    AllowWithPost(PostToken),
    /// Complete the operation with the given status.
    Complete(OpStatus),
}

/// Outcome of the post-open callback.
#[derive(Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// Context attached (or adopted from a raced open).
    Attached,
    /// Open failed or is draining; nothing to do.
    Skipped,
    /// Context could not be established; the open was cancelled and must
    /// complete with this status.
    Cancelled(OpStatus),
}

/// Classification decided at pre-open time, carried into the post callback.
#[derive(Debug)]
pub struct PostToken {
    classification: Classification,
    path: Arc<str>,
}

#[derive(Debug, Clone)]
struct Classification {
    major: RuleMajor,
    minor: RuleMinor,
    pattern: Arc<str>,
}

struct OpenContext {
    classification: OnceLock<Classification>,
    file: FileRef,
    path: Arc<str>,
}

/// Open ("create") operation inputs.
#[derive(Debug)]
pub struct CreateRequest<'a> {
    /// Stream being opened.
    pub stream: StreamId,
    /// Requesting process and thread.
    pub requestor: Requestor,
    /// Raw name as issued by the caller.
    pub name: &'a str,
    /// Open-time flags.
    pub flags: CreateFlags,
}

/// Write operation inputs.
#[derive(Debug)]
pub struct WriteRequest {
    /// Target stream.
    pub stream: StreamId,
    /// Requesting process and thread.
    pub requestor: Requestor,
}

/// Set-information sub-kinds the pipeline classifies on.
#[derive(Debug, Clone, Copy)]
pub enum SetInfoOp<'a> {
    /// Delete disposition on the opened file or directory.
    DeleteDisposition,
    /// Rename to the given raw destination.
    Rename {
        /// Raw destination name.
        target: &'a str,
    },
    /// Any other sub-kind; passes through.
    Other,
}

/// Set-information operation inputs.
#[derive(Debug)]
pub struct SetInfoRequest<'a> {
    /// Target stream.
    pub stream: StreamId,
    /// Requesting process and thread.
    pub requestor: Requestor,
    /// Raw name the stream was opened under, used for audit records when
    /// the stream carries no context.
    pub name: &'a str,
    /// Sub-kind.
    pub op: SetInfoOp<'a>,
}

/// The interception pipeline.
pub struct Pipeline<H: HostOps> {
    store: Arc<RuleStore>,
    queue: Arc<RecordQueue>,
    host: H,
    contexts: DashMap<StreamId, Arc<OpenContext>>,
    deny_open_status: OpStatus,
}

impl<H: HostOps> Pipeline<H> {
    /// Build a pipeline over the shared store and queue.
    pub fn new(store: Arc<RuleStore>, queue: Arc<RecordQueue>, host: H) -> Self {
        Pipeline {
            store,
            queue,
            host,
            contexts: DashMap::new(),
            deny_open_status: OpStatus::ACCESS_DENIED,
        }
    }

    /// Override the status used to deny matched opens. The not-found variant
    /// hides the file's existence instead of reporting a denial.
    #[must_use]
    pub fn with_deny_open_status(mut self, status: OpStatus) -> Self {
        self.deny_open_status = status;
        self
    }

    /// Pre-open callback.
    pub fn pre_create(&self, req: &CreateRequest<'_>) -> PreDecision {
        if req.flags.policy_exempt() {
            return PreDecision::Allow;
        }
        let path = match self.host.resolve_name(req.stream, req.name) {
            Ok(p) => p,
            Err(status) => {
                debug!(%status, name = req.name, "name resolution failed");
                return PreDecision::Complete(status);
            }
        };
        if final_component(&path).is_empty() {
            return PreDecision::Allow;
        }
        match self.store.match_first(&path) {
            None => PreDecision::Allow,
            Some(m) => match m.major {
                RuleMajor::AccessDenied => {
                    if m.minor == RuleMinor::Monitored {
                        self.emit(RecordParts {
                            major_fn: OpMajor::Create,
                            minor_fn: set_info::NONE,
                            requestor: req.requestor,
                            file: FileRef::default(),
                            op_status: self.deny_open_status,
                            rule_pattern: &m.pattern,
                            file_path: &path,
                            rename_path: None,
                        });
                    }
                    debug!(%path, pattern = %m.pattern, "open denied");
                    PreDecision::Complete(self.deny_open_status)
                }
                RuleMajor::ReadOnly => PreDecision::AllowWithPost(PostToken {
                    classification: Classification {
                        major: m.major,
                        minor: m.minor,
                        pattern: m.pattern,
                    },
                    path: Arc::from(path.as_str()),
                }),
            },
        }
    }

    /// Post-open callback; runs only when pre-open asked for it. `draining`
    /// mirrors the host's teardown-in-progress flag.
    pub fn post_create(
        &self,
        stream: StreamId,
        io_status: OpStatus,
        token: PostToken,
        draining: bool,
    ) -> PostOutcome {
        if draining || !io_status.is_success() {
            return PostOutcome::Skipped;
        }
        let file = match self.host.file_reference(stream) {
            Ok(f) => f,
            Err(status) => {
                warn!(%status, ?stream, "file reference unavailable, cancelling open");
                self.host.cancel_open(stream);
                return PostOutcome::Cancelled(status);
            }
        };
        let path = Arc::clone(&token.path);
        let ctx = self
            .contexts
            .entry(stream)
            .or_insert_with(|| {
                Arc::new(OpenContext { classification: OnceLock::new(), file, path })
            })
            .downgrade();
        // First classifier wins; a raced open adopts what is already set.
        let _ = ctx.classification.set(token.classification);
        trace!(?stream, path = %token.path, "stream classified");
        PostOutcome::Attached
    }

    /// Pre-write callback.
    pub fn pre_write(&self, req: &WriteRequest) -> PreDecision {
        let Some(ctx) = self.contexts.get(&req.stream).map(|e| Arc::clone(e.value())) else {
            return PreDecision::Allow;
        };
        let Some(class) = ctx.classification.get() else {
            return PreDecision::Allow;
        };
        if class.major != RuleMajor::ReadOnly {
            return PreDecision::Allow;
        }
        if class.minor == RuleMinor::Monitored {
            self.emit(RecordParts {
                major_fn: OpMajor::Write,
                minor_fn: set_info::NONE,
                requestor: req.requestor,
                file: ctx.file,
                op_status: OpStatus::ACCESS_DENIED,
                rule_pattern: &class.pattern,
                file_path: &ctx.path,
                rename_path: None,
            });
        }
        debug!(path = %ctx.path, "write denied on read-only stream");
        PreDecision::Complete(OpStatus::ACCESS_DENIED)
    }

    /// Pre-set-information callback.
    pub fn pre_set_information(&self, req: &SetInfoRequest<'_>) -> PreDecision {
        let ctx = self.contexts.get(&req.stream).map(|e| Arc::clone(e.value()));
        let class = ctx.as_ref().and_then(|c| c.classification.get());
        match req.op {
            SetInfoOp::DeleteDisposition => {
                if class.map(|c| c.major) == Some(RuleMajor::ReadOnly) {
                    debug!(stream = ?req.stream, "delete disposition denied on read-only stream");
                    return PreDecision::Complete(OpStatus::ACCESS_DENIED);
                }
                PreDecision::Allow
            }
            SetInfoOp::Rename { target } => {
                let dest = match self.host.resolve_rename_target(req.stream, target) {
                    Ok(d) => d,
                    Err(status) => {
                        debug!(%status, target, "rename target resolution failed");
                        return PreDecision::Complete(status);
                    }
                };
                let dest_rules = self.store.check_matches(&dest);
                let dest_denied =
                    dest_rules.iter().find(|r| r.major == RuleMajor::AccessDenied);
                let dest_monitored =
                    dest_rules.iter().find(|r| r.minor == RuleMinor::Monitored);
                let src_monitored = class.filter(|c| c.minor == RuleMinor::Monitored);

                if src_monitored.is_some() || dest_monitored.is_some() {
                    let op_status = if dest_denied.is_some() {
                        OpStatus::ACCESS_DENIED
                    } else {
                        OpStatus::SUCCESS
                    };
                    // Attribute the record to the deciding rule: a denying
                    // destination rule first, then the source's monitor,
                    // then the destination's.
                    let rule_pattern: &str = dest_denied
                        .map(|r| r.pattern.as_str())
                        .or_else(|| src_monitored.map(|c| &*c.pattern))
                        .or_else(|| dest_monitored.map(|r| r.pattern.as_str()))
                        .unwrap_or_default();
                    let src_path = match ctx.as_ref() {
                        Some(c) => c.path.to_string(),
                        None => self
                            .host
                            .resolve_name(req.stream, req.name)
                            .unwrap_or_else(|_| req.name.to_string()),
                    };
                    self.emit(RecordParts {
                        major_fn: OpMajor::SetInformation,
                        minor_fn: set_info::RENAME,
                        requestor: req.requestor,
                        file: ctx.as_ref().map(|c| c.file).unwrap_or_default(),
                        op_status,
                        rule_pattern,
                        file_path: &src_path,
                        rename_path: Some(&dest),
                    });
                }
                if dest_denied.is_some() {
                    debug!(%dest, "rename denied by destination rule");
                    return PreDecision::Complete(OpStatus::ACCESS_DENIED);
                }
                PreDecision::Allow
            }
            SetInfoOp::Other => PreDecision::Allow,
        }
    }

    /// Cleanup callback: drop the pipeline's reference to the stream's
    /// context. The context itself dies with its last holder.
    pub fn cleanup(&self, stream: StreamId) {
        if self.contexts.remove(&stream).is_some() {
            trace!(?stream, "stream context released");
        }
    }

    /// Classification currently attached to a stream, if any.
    #[must_use]
    pub fn classification(&self, stream: StreamId) -> Option<(RuleMajor, RuleMinor)> {
        self.contexts
            .get(&stream)
            .and_then(|c| c.classification.get().map(|cl| (cl.major, cl.minor)))
    }

    fn emit(&self, parts: RecordParts<'_>) {
        let queued = self.queue.enqueue(MonitorRecord {
            major_fn: parts.major_fn,
            minor_fn: parts.minor_fn,
            pid: parts.requestor.pid,
            tid: parts.requestor.tid,
            file: parts.file,
            record_time: ticks_now(),
            op_status: parts.op_status,
            rule_pattern: parts.rule_pattern.to_string(),
            file_path: parts.file_path.to_string(),
            rename_path: parts.rename_path.map(str::to_string),
        });
        if !queued {
            trace!(path = parts.file_path, "monitor record dropped");
        }
    }
}

struct RecordParts<'a> {
    major_fn: OpMajor,
    minor_fn: u8,
    requestor: Requestor,
    file: FileRef,
    op_status: OpStatus,
    rule_pattern: &'a str,
    file_path: &'a str,
    rename_path: Option<&'a str>,
}

fn final_component(path: &str) -> &str {
    path.rsplit('\\').next().unwrap_or(path)
}
