// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core duel domain types shared by the record store, the request handlers
//! and the settlement pipeline.

use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Full 0x-prefixed hex form of an address (H160 Display truncates).
pub fn address_hex(addr: &EthAddress) -> String {
    format!("{:?}", addr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantSlot {
    First,
    Second,
}

impl ParticipantSlot {
    pub fn other(&self) -> ParticipantSlot {
        match self {
            ParticipantSlot::First => ParticipantSlot::Second,
            ParticipantSlot::Second => ParticipantSlot::First,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantSlot::First => "first",
            ParticipantSlot::Second => "second",
        }
    }
}

impl std::fmt::Display for ParticipantSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StakeState {
    Unstaked,
    Pending,
    Staked,
}

impl std::fmt::Display for StakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StakeState::Unstaked => "unstaked",
            StakeState::Pending => "pending",
            StakeState::Staked => "staked",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelStatus {
    WaitingForStakes,
    Accepted,
    MonitoringHealth,
    Completed,
    CancelledTimeout,
}

impl DuelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuelStatus::WaitingForStakes => "waiting_for_stakes",
            DuelStatus::Accepted => "accepted",
            DuelStatus::MonitoringHealth => "monitoring_health",
            DuelStatus::Completed => "completed",
            DuelStatus::CancelledTimeout => "cancelled_timeout",
        }
    }

    /// The authoritative state machine. Status only ever advances:
    /// waiting_for_stakes -> accepted -> monitoring_health -> completed,
    /// with waiting_for_stakes -> cancelled_timeout as the timeout exit.
    pub fn can_transition_to(&self, next: DuelStatus) -> bool {
        matches!(
            (self, next),
            (DuelStatus::WaitingForStakes, DuelStatus::Accepted)
                | (DuelStatus::WaitingForStakes, DuelStatus::CancelledTimeout)
                | (DuelStatus::Accepted, DuelStatus::MonitoringHealth)
                | (DuelStatus::MonitoringHealth, DuelStatus::Completed)
        )
    }

    /// Terminal statuses never change again (except a late settlement ref).
    pub fn is_terminal(&self) -> bool {
        matches!(self, DuelStatus::Completed | DuelStatus::CancelledTimeout)
    }
}

impl std::fmt::Display for DuelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted status tag for one ledger-affecting operation. Written as
/// Pending before the escrow call is made, moved to Confirmed/Failed once the
/// call returns, and left Unknown when the outcome could not be observed.
/// The reconciler resolves non-Confirmed records against ledger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerCallStatus {
    Pending,
    Confirmed,
    Failed,
    Unknown,
}

impl std::fmt::Display for LedgerCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LedgerCallStatus::Pending => "pending",
            LedgerCallStatus::Confirmed => "confirmed",
            LedgerCallStatus::Failed => "failed",
            LedgerCallStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCallRecord {
    pub status: LedgerCallStatus,
    pub tx_ref: Option<String>,
    pub updated_at_ms: u64,
}

impl LedgerCallRecord {
    pub fn pending() -> Self {
        Self {
            status: LedgerCallStatus::Pending,
            tx_ref: None,
            updated_at_ms: now_ms(),
        }
    }

    pub fn confirmed(tx_ref: String) -> Self {
        Self {
            status: LedgerCallStatus::Confirmed,
            tx_ref: Some(tx_ref),
            updated_at_ms: now_ms(),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: LedgerCallStatus::Failed,
            tx_ref: None,
            updated_at_ms: now_ms(),
        }
    }

    /// Confirmation inferred from ledger state when the original transaction
    /// reference was never observed.
    pub fn confirmed_unreferenced() -> Self {
        Self {
            status: LedgerCallStatus::Confirmed,
            tx_ref: None,
            updated_at_ms: now_ms(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == LedgerCallStatus::Confirmed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringWindow {
    pub start_ms: u64,
    pub end_ms: u64,
    pub duration_minutes: u64,
}

impl MonitoringWindow {
    pub fn starting_now(duration_minutes: u64) -> Self {
        let start_ms = now_ms();
        Self {
            start_ms,
            end_ms: start_ms + duration_minutes * 60_000,
            duration_minutes,
        }
    }

    pub fn is_elapsed(&self, now: u64) -> bool {
        now >= self.end_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeMetadata {
    /// Name of the cumulative metric scored during monitoring, e.g. "steps".
    pub metric_name: String,
    /// Free-form challenge label shown to users.
    pub label: String,
}

impl ChallengeMetadata {
    pub fn steps(label: impl Into<String>) -> Self {
        Self {
            metric_name: "steps".to_string(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub address: EthAddress,
    pub stake_state: StakeState,
    pub stake_tx_ref: Option<String>,
    pub stake_call: Option<LedgerCallRecord>,
    pub refund_call: Option<LedgerCallRecord>,
    pub final_score: Option<u64>,
    pub progress: u64,
}

impl Participant {
    pub fn new(address: EthAddress) -> Self {
        Self {
            address,
            stake_state: StakeState::Unstaked,
            stake_tx_ref: None,
            stake_call: None,
            refund_call: None,
            final_score: None,
            progress: 0,
        }
    }

    pub fn is_staked(&self) -> bool {
        self.stake_state == StakeState::Staked
    }
}

/// Outcome of a completed duel. `None` on the record means "not yet decided";
/// a tie is an explicit decision, not an absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuelOutcome {
    Winner(ParticipantSlot),
    Tie,
}

impl DuelOutcome {
    pub fn winner(&self) -> Option<ParticipantSlot> {
        match self {
            DuelOutcome::Winner(slot) => Some(*slot),
            DuelOutcome::Tie => None,
        }
    }
}

/// The central entity: one two-party wagered fitness contest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Duel {
    pub id: String,
    /// On-ledger id, assigned once from the persisted counter and immutable
    /// afterwards.
    pub numeric_id: Option<u64>,
    pub first: Participant,
    pub second: Participant,
    /// Both sides stake the same amount, in escrow contract units.
    pub stake_amount: u64,
    pub status: DuelStatus,
    pub staking_deadline_ms: Option<u64>,
    pub window: Option<MonitoringWindow>,
    pub outcome: Option<DuelOutcome>,
    pub settlement_call: Option<LedgerCallRecord>,
    pub settlement_tx_ref: Option<String>,
    /// Set when both stakes confirmed on the ledger; settlement is only
    /// attempted for ledger-active duels.
    pub ledger_active: bool,
    pub challenge: ChallengeMetadata,
    pub created_at_ms: u64,
}

impl Duel {
    pub fn new(
        id: impl Into<String>,
        first: EthAddress,
        second: EthAddress,
        stake_amount: u64,
        challenge: ChallengeMetadata,
    ) -> Self {
        Self {
            id: id.into(),
            numeric_id: None,
            first: Participant::new(first),
            second: Participant::new(second),
            stake_amount,
            status: DuelStatus::WaitingForStakes,
            staking_deadline_ms: None,
            window: None,
            outcome: None,
            settlement_call: None,
            settlement_tx_ref: None,
            ledger_active: false,
            challenge,
            created_at_ms: now_ms(),
        }
    }

    pub fn with_staking_deadline(mut self, deadline_ms: u64) -> Self {
        self.staking_deadline_ms = Some(deadline_ms);
        self
    }

    pub fn participant(&self, slot: ParticipantSlot) -> &Participant {
        match slot {
            ParticipantSlot::First => &self.first,
            ParticipantSlot::Second => &self.second,
        }
    }

    pub fn participant_mut(&mut self, slot: ParticipantSlot) -> &mut Participant {
        match slot {
            ParticipantSlot::First => &mut self.first,
            ParticipantSlot::Second => &mut self.second,
        }
    }

    pub fn slot_of(&self, address: &EthAddress) -> Option<ParticipantSlot> {
        if self.first.address == *address {
            Some(ParticipantSlot::First)
        } else if self.second.address == *address {
            Some(ParticipantSlot::Second)
        } else {
            None
        }
    }

    pub fn both_staked(&self) -> bool {
        self.first.is_staked() && self.second.is_staked()
    }

    pub fn staking_deadline_elapsed(&self, now: u64) -> bool {
        matches!(self.staking_deadline_ms, Some(deadline) if now >= deadline)
    }

    /// Seconds until the staking deadline, if one is set. Saturates at zero.
    pub fn staking_time_remaining_secs(&self, now: u64) -> Option<u64> {
        self.staking_deadline_ms
            .map(|deadline| deadline.saturating_sub(now) / 1000)
    }

    /// True when any ledger-call record still needs reconciliation.
    pub fn has_unresolved_ledger_calls(&self) -> bool {
        let unresolved =
            |record: &Option<LedgerCallRecord>| matches!(record, Some(r) if !r.is_resolved());
        unresolved(&self.first.stake_call)
            || unresolved(&self.second.stake_call)
            || unresolved(&self.first.refund_call)
            || unresolved(&self.second.refund_call)
            || unresolved(&self.settlement_call)
    }
}

// Event names published to the duel's realtime channel.
pub const EVENT_PARTICIPANT_STAKED: &str = "participant_staked";
pub const EVENT_DUEL_BECAME_ACTIVE: &str = "duel_became_active";
pub const EVENT_MONITORING_STARTED: &str = "monitoring_started";
pub const EVENT_DUEL_COMPLETED: &str = "duel_completed";
pub const EVENT_DUEL_CANCELLED: &str = "duel_cancelled";

pub const DISPOSITION_SETTLEMENT_IN_PROGRESS: &str = "settlement in progress";
pub const DISPOSITION_TIE_REFUNDED: &str = "tie — stakes refunded";
pub const DISPOSITION_STAKING_TIMED_OUT: &str = "staking window timed out — stakes refunded";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeStatuses {
    pub first: StakeState,
    pub second: StakeState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantStakedPayload {
    pub staked_participant: String,
    pub transaction_ref: String,
    /// Seconds the other participant has left before the staking deadline.
    pub time_remaining: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelBecameActivePayload {
    pub status: DuelStatus,
    pub stake_statuses: StakeStatuses,
    pub stake_amount: u64,
    pub numeric_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStartedPayload {
    pub window: MonitoringWindow,
    pub challenge_metadata: ChallengeMetadata,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalScores {
    pub first: u64,
    pub second: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelCompletedPayload {
    /// Winning participant's payout address, absent for a tie.
    pub winner: Option<String>,
    pub final_scores: FinalScores,
    pub challenge_metadata: ChallengeMetadata,
    pub disposition_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelCancelledPayload {
    pub status: DuelStatus,
    pub disposition_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> EthAddress {
        EthAddress::from([byte; 20])
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&DuelStatus::WaitingForStakes).unwrap(),
            "\"waiting_for_stakes\""
        );
        assert_eq!(
            serde_json::to_string(&DuelStatus::MonitoringHealth).unwrap(),
            "\"monitoring_health\""
        );
        assert_eq!(
            serde_json::to_string(&DuelStatus::CancelledTimeout).unwrap(),
            "\"cancelled_timeout\""
        );
        let status: DuelStatus = serde_json::from_str("\"accepted\"").unwrap();
        assert_eq!(status, DuelStatus::Accepted);
    }

    #[test]
    fn test_status_transitions_are_forward_only() {
        use DuelStatus::*;
        let allowed = [
            (WaitingForStakes, Accepted),
            (WaitingForStakes, CancelledTimeout),
            (Accepted, MonitoringHealth),
            (MonitoringHealth, Completed),
        ];
        let all = [
            WaitingForStakes,
            Accepted,
            MonitoringHealth,
            Completed,
            CancelledTimeout,
        ];
        for from in all {
            for to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{} -> {} should be {}",
                    from,
                    to,
                    expected
                );
            }
        }
        // no backward transition exists at all
        assert!(!Completed.can_transition_to(MonitoringHealth));
        assert!(!CancelledTimeout.can_transition_to(WaitingForStakes));
    }

    #[test]
    fn test_slot_lookup_and_both_staked() {
        let mut duel = Duel::new("duel-1", addr(1), addr(2), 10, ChallengeMetadata::steps("10k"));
        assert_eq!(duel.slot_of(&addr(1)), Some(ParticipantSlot::First));
        assert_eq!(duel.slot_of(&addr(2)), Some(ParticipantSlot::Second));
        assert_eq!(duel.slot_of(&addr(9)), None);

        assert!(!duel.both_staked());
        duel.first.stake_state = StakeState::Staked;
        assert!(!duel.both_staked());
        duel.second.stake_state = StakeState::Staked;
        assert!(duel.both_staked());
    }

    #[test]
    fn test_staking_deadline_helpers() {
        let duel = Duel::new("duel-1", addr(1), addr(2), 10, ChallengeMetadata::steps("10k"))
            .with_staking_deadline(100_000);
        assert!(!duel.staking_deadline_elapsed(99_999));
        assert!(duel.staking_deadline_elapsed(100_000));
        assert_eq!(duel.staking_time_remaining_secs(40_000), Some(60));
        assert_eq!(duel.staking_time_remaining_secs(200_000), Some(0));

        let no_deadline = Duel::new("duel-2", addr(1), addr(2), 10, ChallengeMetadata::steps("x"));
        assert!(!no_deadline.staking_deadline_elapsed(u64::MAX));
        assert_eq!(no_deadline.staking_time_remaining_secs(0), None);
    }

    #[test]
    fn test_monitoring_window() {
        let window = MonitoringWindow::starting_now(30);
        assert_eq!(window.end_ms - window.start_ms, 30 * 60_000);
        assert!(!window.is_elapsed(window.start_ms));
        assert!(window.is_elapsed(window.end_ms));
    }

    #[test]
    fn test_unresolved_ledger_calls() {
        let mut duel = Duel::new("duel-1", addr(1), addr(2), 10, ChallengeMetadata::steps("x"));
        assert!(!duel.has_unresolved_ledger_calls());

        duel.settlement_call = Some(LedgerCallRecord::failed());
        assert!(duel.has_unresolved_ledger_calls());

        duel.settlement_call = Some(LedgerCallRecord::confirmed("0xabc".to_string()));
        assert!(!duel.has_unresolved_ledger_calls());

        duel.first.stake_call = Some(LedgerCallRecord::pending());
        assert!(duel.has_unresolved_ledger_calls());
    }

    #[test]
    fn test_duel_record_serde_round_trip() {
        let mut duel = Duel::new("duel-1", addr(1), addr(2), 25, ChallengeMetadata::steps("10k"))
            .with_staking_deadline(now_ms() + 60_000);
        duel.numeric_id = Some(42);
        duel.first.stake_state = StakeState::Staked;
        duel.first.stake_tx_ref = Some("0xdead".to_string());
        duel.first.stake_call = Some(LedgerCallRecord::confirmed("0xdead".to_string()));

        let json = serde_json::to_string(&duel).unwrap();
        let back: Duel = serde_json::from_str(&json).unwrap();
        assert_eq!(duel, back);
        // wire casing is camelCase
        assert!(json.contains("\"numericId\":42"));
        assert!(json.contains("\"stakeState\":\"staked\""));
    }

    #[test]
    fn test_outcome_winner() {
        assert_eq!(
            DuelOutcome::Winner(ParticipantSlot::First).winner(),
            Some(ParticipantSlot::First)
        );
        assert_eq!(DuelOutcome::Tie.winner(), None);
    }
}
