use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use colloquy_protocol::{PermissionBehavior, PermissionMode, ServerEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::outbound::Outbound;

pub const ABORTED_MESSAGE: &str = "aborted";
pub const DENIED_BY_USER_MESSAGE: &str = "Denied by user";

/// Outcome handed back to the engine for one tool invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionDecision {
    #[serde(rename_all = "camelCase")]
    Allow { updated_input: Value },
    Deny { message: String },
}

impl PermissionDecision {
    pub fn aborted() -> Self {
        Self::Deny {
            message: ABORTED_MESSAGE.to_owned(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Immutable snapshot swapped atomically on mode changes.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ArbitrationPolicy {
    mode: PermissionMode,
    safe_tools: Arc<HashSet<String>>,
}

impl ArbitrationPolicy {
    fn auto_allows(&self, tool_name: &str) -> bool {
        match self.mode {
            PermissionMode::AlwaysAllow => true,
            PermissionMode::AllowSafe => self.safe_tools.contains(tool_name),
            PermissionMode::ConfirmAll => false,
        }
    }
}

#[derive(Debug)]
struct PendingPermission {
    tool_name: String,
    input: Value,
    resolver: oneshot::Sender<PermissionDecision>,
}

/// Correlates escalated tool-use requests with human decisions for one session.
/// Every request id resolves exactly once: by `resolve`, or by cancellation of the
/// owning run scope, or (if the waiting future is dropped) by removal without a decision.
#[derive(Debug)]
pub struct PermissionArbitrator {
    policy: ArcSwap<ArbitrationPolicy>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingPermission>>,
    outbound: Outbound,
}

impl PermissionArbitrator {
    pub fn new<I, S>(mode: PermissionMode, safe_tools: I, outbound: Outbound) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            policy: ArcSwap::from_pointee(ArbitrationPolicy {
                mode,
                safe_tools: Arc::new(safe_tools.into_iter().map(Into::into).collect()),
            }),
            next_request_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            outbound,
        }
    }

    pub fn mode(&self) -> PermissionMode {
        self.policy.load().mode
    }

    /// Affects requests decided after this call; already escalated requests stay pending.
    pub fn set_mode(&self, mode: PermissionMode) {
        let current = self.policy.load_full();
        self.policy.store(Arc::new(ArbitrationPolicy {
            mode,
            safe_tools: Arc::clone(&current.safe_tools),
        }));
    }

    /// Decide one tool invocation, escalating to the human when the policy requires it.
    pub async fn decide(
        &self,
        tool_name: &str,
        input: Value,
        cancel: &CancellationToken,
    ) -> PermissionDecision {
        if self.policy.load().auto_allows(tool_name) {
            return PermissionDecision::Allow {
                updated_input: input,
            };
        }
        if cancel.is_cancelled() {
            return PermissionDecision::aborted();
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::AcqRel) + 1;
        let (resolver, mut decided) = oneshot::channel();
        self.lock_pending().insert(
            request_id,
            PendingPermission {
                tool_name: tool_name.to_owned(),
                input: input.clone(),
                resolver,
            },
        );
        let _cleanup = PendingCleanup {
            arbitrator: self,
            request_id,
        };

        tracing::debug!(request_id, tool_name, "escalating tool permission request");
        self.outbound
            .send(ServerEnvelope::PermissionRequest {
                request_id: request_id.to_string(),
                tool_name: tool_name.to_owned(),
                input,
            })
            .await;

        tokio::select! {
            biased;
            decision = &mut decided => decision.unwrap_or_else(|_| PermissionDecision::aborted()),
            _ = cancel.cancelled() => {
                if self.take_pending(request_id).is_some() {
                    tracing::debug!(request_id, "permission request aborted by run cancellation");
                    PermissionDecision::aborted()
                } else {
                    // A decision claimed the entry first; it wins.
                    decided.try_recv().unwrap_or_else(|_| PermissionDecision::aborted())
                }
            }
        }
    }

    /// Apply a human decision. Returns false for unknown or already resolved ids.
    /// On allow, the input recorded at escalation time is echoed back unmodified.
    pub fn resolve(
        &self,
        request_id: u64,
        behavior: PermissionBehavior,
        message: Option<String>,
    ) -> bool {
        let Some(entry) = self.take_pending(request_id) else {
            tracing::debug!(request_id, "ignoring decision for unknown permission request");
            return false;
        };

        let decision = match behavior {
            PermissionBehavior::Allow => PermissionDecision::Allow {
                updated_input: entry.input,
            },
            PermissionBehavior::Deny => PermissionDecision::Deny {
                message: message.unwrap_or_else(|| DENIED_BY_USER_MESSAGE.to_owned()),
            },
        };
        tracing::debug!(
            request_id,
            tool_name = %entry.tool_name,
            allow = decision.is_allow(),
            "permission request resolved"
        );
        entry.resolver.send(decision).is_ok()
    }

    /// Snapshot of unresolved request ids, ascending.
    pub fn pending_request_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock_pending().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn take_pending(&self, request_id: u64) -> Option<PendingPermission> {
        self.lock_pending().remove(&request_id)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingPermission>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Removes the entry if the waiting future goes away without either path firing.
struct PendingCleanup<'a> {
    arbitrator: &'a PermissionArbitrator,
    request_id: u64,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        self.arbitrator.take_pending(self.request_id);
    }
}

/// Permission hook handed to the engine: the session's arbitrator bound to one run scope.
#[derive(Clone, Debug)]
pub struct PermissionGate {
    arbitrator: Arc<PermissionArbitrator>,
    cancel: CancellationToken,
}

impl PermissionGate {
    pub fn new(arbitrator: Arc<PermissionArbitrator>, cancel: CancellationToken) -> Self {
        Self { arbitrator, cancel }
    }

    /// Same arbitrator, narrower scope: cancelling `cancel` aborts only checks made
    /// through the returned gate.
    pub fn rescoped(&self, cancel: CancellationToken) -> Self {
        Self {
            arbitrator: Arc::clone(&self.arbitrator),
            cancel,
        }
    }

    pub async fn check(&self, tool_name: &str, input: Value) -> PermissionDecision {
        self.arbitrator.decide(tool_name, input, &self.cancel).await
    }
}
