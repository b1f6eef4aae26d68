//! Advisory lease over the shared input devices.
//!
//! The lease is the `owner` field of the control state. Acquiring it is not
//! exclusive at the protocol level: two processes may both observe
//! "allowed" and both write `owner`, last writer wins. [`Gate::try_acquire`]
//! narrows that window by re-reading after the write.

use crate::emergency::EmergencyStop;
use crate::state::StatePatch;
use crate::store::{is_stale, StateStore};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a gate check allowed or denied an actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionReason {
    Ok,
    EmergencyStop,
    ControlsPaused,
    OwnedBy(String),
    OwnerStale(String),
    OutsideControlWindow,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::Ok => write!(f, "ok"),
            DecisionReason::EmergencyStop => write!(f, "emergency_stop"),
            DecisionReason::ControlsPaused => write!(f, "controls_paused"),
            DecisionReason::OwnedBy(owner) => write!(f, "controls_owned_by:{owner}"),
            DecisionReason::OwnerStale(owner) => write!(f, "controls_owner_stale:{owner}"),
            DecisionReason::OutsideControlWindow => write!(f, "outside_control_window"),
        }
    }
}

impl Serialize for DecisionReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of a gate check. A denial is a normal answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
}

impl Decision {
    fn allow(reason: DecisionReason) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    fn deny(reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.allowed { "allowed" } else { "denied" };
        write!(f, "{verdict} ({})", self.reason)
    }
}

/// Result of [`Gate::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    /// We wrote the owner and still hold it on re-read.
    Acquired(Decision),
    /// The gate refused; nothing was written.
    Denied(Decision),
    /// Another writer replaced our owner between write and re-read.
    Lost { to: String },
}

impl LeaseAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseAcquisition::Acquired(_))
    }
}

/// Conditions for clearing the owner from outside the owning process.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    /// Only clear when the current owner equals this.
    pub if_owner: String,
    /// Clear regardless of the current owner.
    pub force: bool,
    /// When positive, only clear if the state is older than this.
    pub stale_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released { previous: String },
    NotStale,
    OwnerMismatch { current: String },
}

/// Composite safety gate consulted before any real input actuation.
#[derive(Clone)]
pub struct Gate {
    store: Arc<dyn StateStore>,
    emergency: EmergencyStop,
}

impl Gate {
    pub fn new(store: Arc<dyn StateStore>, emergency: EmergencyStop) -> Self {
        Self { store, emergency }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn emergency(&self) -> &EmergencyStop {
        &self.emergency
    }

    /// Decides whether `requested_owner` may drive input right now.
    ///
    /// Precedence, first match wins: emergency stop, pause, fresh foreign
    /// owner (deny), stale foreign owner (allow with override reason), ok.
    pub fn may_proceed(&self, requested_owner: &str, stale_after_s: f64) -> Decision {
        if self.emergency.is_active() {
            return Decision::deny(DecisionReason::EmergencyStop);
        }

        let state = self.store.read();
        if state.paused() {
            return Decision::deny(DecisionReason::ControlsPaused);
        }

        let owner = state.owner();
        if owner.is_empty() || owner == requested_owner {
            return Decision::allow(DecisionReason::Ok);
        }

        if is_stale(&state, stale_after_s) {
            debug!(%owner, requested_owner, "Overriding stale controls owner");
            Decision::allow(DecisionReason::OwnerStale(owner))
        } else {
            Decision::deny(DecisionReason::OwnedBy(owner))
        }
    }

    /// Finer-grained gate for single-action modules that do not take the
    /// lease: paused always blocks; a fresh state blocks outside the control
    /// window or under a foreign owner. Stale state never blocks.
    pub fn may_actuate(&self, requested_owner: &str, stale_after_s: f64) -> Decision {
        if self.emergency.is_active() {
            return Decision::deny(DecisionReason::EmergencyStop);
        }

        let state = self.store.read();
        if state.paused() {
            return Decision::deny(DecisionReason::ControlsPaused);
        }

        let stale = is_stale(&state, stale_after_s);
        if !stale && state.in_control_window() == Some(false) {
            return Decision::deny(DecisionReason::OutsideControlWindow);
        }

        let owner = state.owner();
        if owner.is_empty() || owner == requested_owner {
            Decision::allow(DecisionReason::Ok)
        } else if stale {
            Decision::allow(DecisionReason::OwnerStale(owner))
        } else {
            Decision::deny(DecisionReason::OwnedBy(owner))
        }
    }

    /// Writes `owner` (empty releases) with a refreshed timestamp.
    pub fn set_owner(&self, owner: &str) {
        self.store.write(&StatePatch::new().owner(owner));
    }

    /// Gate check, owner write, then a re-read to confirm we still hold it.
    pub fn try_acquire(&self, owner: &str, stale_after_s: f64) -> LeaseAcquisition {
        let decision = self.may_proceed(owner, stale_after_s);
        if !decision.allowed {
            return LeaseAcquisition::Denied(decision);
        }

        self.set_owner(owner);
        let current = self.store.read().owner();
        if current != owner {
            warn!(owner, winner = %current, "Lost controls lease to a concurrent writer");
            return LeaseAcquisition::Lost { to: current };
        }

        info!(owner, reason = %decision.reason, "Acquired controls lease");
        LeaseAcquisition::Acquired(decision)
    }

    /// Clears the owner only if it is still `owner`. Returns whether it did.
    pub fn release(&self, owner: &str) -> bool {
        let current = self.store.read().owner();
        if current.is_empty() {
            return false;
        }
        if current != owner {
            debug!(owner, %current, "Not releasing lease held by another owner");
            return false;
        }
        self.set_owner("");
        info!(owner, "Released controls lease");
        true
    }

    /// Operator-driven release. Never touches `paused`.
    pub fn release_if(&self, request: &ReleaseRequest) -> ReleaseOutcome {
        let state = self.store.read();
        let current = state.owner();

        if request.stale_seconds > 0.0 && !is_stale(&state, request.stale_seconds) {
            return ReleaseOutcome::NotStale;
        }
        if !request.force && current != request.if_owner {
            return ReleaseOutcome::OwnerMismatch { current };
        }

        self.set_owner("");
        ReleaseOutcome::Released { previous: current }
    }

    /// Records the current burst-of-automation window.
    pub fn update_control_window(&self, in_control: bool, remaining_s: f64) {
        self.store
            .write(&StatePatch::new().control_window(in_control, remaining_s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ControlState;
    use crate::store::MemoryStateStore;
    use crate::utils::now_epoch;
    use serde_json::{json, Value};

    fn gate_with(value: Value) -> (Gate, Arc<MemoryStateStore>) {
        let state: ControlState = serde_json::from_value(value).unwrap();
        let store = Arc::new(MemoryStateStore::with_state(state));
        let gate = Gate::new(store.clone(), EmergencyStop::disabled());
        (gate, store)
    }

    #[test]
    fn test_pause_precedes_owner_check() {
        let now = now_epoch();
        for ts in [now, now - 10_000.0] {
            let (gate, _) = gate_with(json!({"paused": true, "owner": "x", "ts": ts}));
            let decision = gate.may_proceed("y", 10.0);
            assert!(!decision.allowed);
            assert_eq!(decision.reason, DecisionReason::ControlsPaused);
        }
    }

    #[test]
    fn test_fresh_foreign_owner_blocks_but_not_self() {
        let (gate, _) = gate_with(json!({"owner": "x", "paused": false, "ts": now_epoch()}));
        let denied = gate.may_proceed("y", 10.0);
        assert!(!denied.allowed);
        assert_eq!(denied.reason.to_string(), "controls_owned_by:x");

        let own = gate.may_proceed("x", 10.0);
        assert!(own.allowed);
        assert_eq!(own.reason, DecisionReason::Ok);
    }

    #[test]
    fn test_stale_owner_is_overridden() {
        let (gate, _) = gate_with(json!({"owner": "x", "paused": false, "ts": now_epoch() - 1000.0}));
        let decision = gate.may_proceed("y", 10.0);
        assert!(decision.allowed);
        assert!(decision.reason.to_string().starts_with("controls_owner_stale:"));
    }

    #[test]
    fn test_empty_state_is_ok() {
        let (gate, _) = gate_with(json!({}));
        assert_eq!(
            gate.may_proceed("anyone", 10.0),
            Decision {
                allowed: true,
                reason: DecisionReason::Ok
            }
        );
    }

    #[test]
    fn test_decision_serializes_reason_as_string() {
        let decision = Decision::deny(DecisionReason::OwnedBy("agent".into()));
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(
            value,
            json!({"allowed": false, "reason": "controls_owned_by:agent"})
        );
    }

    #[test]
    fn test_try_acquire_writes_owner() {
        let (gate, store) = gate_with(json!({}));
        assert!(gate.try_acquire("workflow_test", 10.0).is_acquired());
        let st = store.read();
        assert_eq!(st.owner(), "workflow_test");
        assert_eq!(st.get("in_use"), Some(&json!(true)));
    }

    #[test]
    fn test_try_acquire_denied_writes_nothing() {
        let (gate, store) = gate_with(json!({"owner": "other", "ts": now_epoch()}));
        let before = store.read();
        match gate.try_acquire("workflow_test", 10.0) {
            LeaseAcquisition::Denied(d) => assert_eq!(d.reason.to_string(), "controls_owned_by:other"),
            other => panic!("expected denial, got {other:?}"),
        }
        assert_eq!(store.read(), before);
    }

    #[test]
    fn test_release_only_clears_own_lease() {
        let (gate, store) = gate_with(json!({"owner": "other", "ts": now_epoch()}));
        assert!(!gate.release("workflow_test"));
        assert_eq!(store.read().owner(), "other");
        assert!(gate.release("other"));
        assert_eq!(store.read().owner(), "");
    }

    #[test]
    fn test_release_if_conditions() {
        let (gate, store) = gate_with(json!({"owner": "agent", "paused": true, "ts": now_epoch()}));
        let mismatch = gate.release_if(&ReleaseRequest {
            if_owner: "workflow_test".into(),
            force: false,
            stale_seconds: 0.0,
        });
        assert_eq!(
            mismatch,
            ReleaseOutcome::OwnerMismatch {
                current: "agent".into()
            }
        );

        let not_stale = gate.release_if(&ReleaseRequest {
            if_owner: "agent".into(),
            force: true,
            stale_seconds: 60.0,
        });
        assert_eq!(not_stale, ReleaseOutcome::NotStale);

        let released = gate.release_if(&ReleaseRequest {
            if_owner: String::new(),
            force: true,
            stale_seconds: 0.0,
        });
        assert_eq!(
            released,
            ReleaseOutcome::Released {
                previous: "agent".into()
            }
        );
        let st = store.read();
        assert_eq!(st.owner(), "");
        assert!(st.paused(), "release must not touch paused");
    }

    #[test]
    fn test_control_window_gate() {
        let now = now_epoch();
        let (gate, _) = gate_with(json!({"in_control_window": false, "ts": now}));
        assert_eq!(
            gate.may_actuate("click", 10.0).reason,
            DecisionReason::OutsideControlWindow
        );

        let (gate, _) = gate_with(json!({"in_control_window": false, "ts": now - 100.0}));
        assert!(gate.may_actuate("click", 10.0).allowed);

        let (gate, _) = gate_with(json!({"owner": "workflow", "ts": now}));
        assert!(!gate.may_actuate("click", 10.0).allowed);

        let (gate, _) = gate_with(json!({"ts": now}));
        assert!(gate.may_actuate("click", 10.0).allowed);
    }
}
