// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::DuelStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuelError {
    // A required request field is missing
    MissingField(&'static str),
    // A request field is present but unusable (bad address, zero amount, ...)
    InvalidField { field: &'static str, reason: String },
    // The referenced duel does not exist
    DuelNotFound(String),
    // The caller is not one of the two participants of the duel
    NotAParticipant(String),
    // The caller has already staked on this duel
    AlreadyStaked(String),
    // The staking deadline has passed
    StakingDeadlinePassed(String),
    // The duel is not in the status the operation requires
    UnexpectedDuelStatus { duel_id: String, actual: DuelStatus },
    // Both stakes must be placed before monitoring can start
    StakesIncomplete(String),
    // No signer capability is registered for the address
    SignerUnavailable(String),
    // An escrow contract call failed (submission, confirmation or revert)
    LedgerCallFailed(String),
    // The record store failed to read or persist
    StorageError(String),
    // Internal error
    InternalError(String),
    // Uncategorized error
    Generic(String),
}

impl DuelError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            DuelError::MissingField(_) => "missing_field",
            DuelError::InvalidField { .. } => "invalid_field",
            DuelError::DuelNotFound(_) => "duel_not_found",
            DuelError::NotAParticipant(_) => "not_a_participant",
            DuelError::AlreadyStaked(_) => "already_staked",
            DuelError::StakingDeadlinePassed(_) => "staking_deadline_passed",
            DuelError::UnexpectedDuelStatus { .. } => "unexpected_duel_status",
            DuelError::StakesIncomplete(_) => "stakes_incomplete",
            DuelError::SignerUnavailable(_) => "signer_unavailable",
            DuelError::LedgerCallFailed(_) => "ledger_call_failed",
            DuelError::StorageError(_) => "storage_error",
            DuelError::InternalError(_) => "internal_error",
            DuelError::Generic(_) => "generic",
        }
    }

    /// Short human-readable title, paired with the Display description in
    /// rejection responses.
    pub fn title(&self) -> &'static str {
        match self {
            DuelError::MissingField(_) | DuelError::InvalidField { .. } => "Invalid request",
            DuelError::DuelNotFound(_) => "Duel not found",
            DuelError::NotAParticipant(_) => "Not a participant",
            DuelError::AlreadyStaked(_)
            | DuelError::StakingDeadlinePassed(_)
            | DuelError::UnexpectedDuelStatus { .. }
            | DuelError::StakesIncomplete(_) => "Duel state conflict",
            DuelError::SignerUnavailable(_) => "Signer unavailable",
            DuelError::LedgerCallFailed(_) => "Ledger call failed",
            DuelError::StorageError(_) => "Storage error",
            DuelError::InternalError(_) | DuelError::Generic(_) => "Internal error",
        }
    }
}

impl std::fmt::Display for DuelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuelError::MissingField(field) => write!(f, "Required field `{}` is missing", field),
            DuelError::InvalidField { field, reason } => {
                write!(f, "Field `{}` is invalid: {}", field, reason)
            }
            DuelError::DuelNotFound(id) => write!(f, "Duel `{}` does not exist", id),
            DuelError::NotAParticipant(addr) => {
                write!(f, "Address {} is not a participant of this duel", addr)
            }
            DuelError::AlreadyStaked(addr) => {
                write!(f, "Address {} has already staked on this duel", addr)
            }
            DuelError::StakingDeadlinePassed(id) => {
                write!(f, "The staking deadline for duel `{}` has passed", id)
            }
            DuelError::UnexpectedDuelStatus { duel_id, actual } => write!(
                f,
                "Duel `{}` is in status `{}` which does not allow this operation",
                duel_id, actual
            ),
            DuelError::StakesIncomplete(id) => write!(
                f,
                "Both participants of duel `{}` must stake before monitoring can start",
                id
            ),
            DuelError::SignerUnavailable(addr) => {
                write!(f, "No transaction signer is registered for address {}", addr)
            }
            DuelError::LedgerCallFailed(msg) => write!(f, "Escrow ledger call failed: {}", msg),
            DuelError::StorageError(msg) => write!(f, "Record store failure: {}", msg),
            DuelError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            DuelError::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

pub type DuelResult<T> = Result<T, DuelError>;
