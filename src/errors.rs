// =============================================================================
// Engine error taxonomy — stable snake_case kinds
// =============================================================================
//
// Two distinct families live here:
//
//   EngineError   — real failures (transport, auth, validation, state,
//                   safety). Propagated with `?`.
//   RejectReason  — strategy/meta decisions. These are values carried in
//                   decision and signal records, never raised as errors.
//
// The `kind()` strings are part of the persisted record format; renaming one
// is a breaking change for anything reading the signals/errors tables.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    // --- Transport ----------------------------------------------------------
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error: {0}")]
    Server(String),

    // --- Authentication -----------------------------------------------------
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),
    #[error("signature type header missing")]
    SignTypeMissing,

    // --- Validation ---------------------------------------------------------
    #[error("invalid order size: {0}")]
    InvalidSize(String),
    #[error("invalid order price: {0}")]
    InvalidPrice(String),
    #[error("order below minimum notional: {0}")]
    MinNotional(String),
    #[error("no instrument metadata for {0}")]
    MissingInstrument(String),

    // --- State --------------------------------------------------------------
    #[error("duplicate order: {0}")]
    DuplicateOrder(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("position missing for {0}")]
    PositionMissing(String),

    // --- Safety -------------------------------------------------------------
    #[error("kill switch active: {0}")]
    KillSwitchActive(String),
    #[error("trading disabled")]
    TradingDisabled,
    #[error("risk limit breached: {0}")]
    RiskLimitBreach(String),

    // --- Store / internal ---------------------------------------------------
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable kind code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::RateLimited(_) => "rate_limited",
            Self::Server(_) => "server_error",
            Self::Auth(_) => "auth_error",
            Self::SignatureMismatch(_) => "signature_mismatch",
            Self::SignTypeMissing => "sign_type_missing",
            Self::InvalidSize(_) => "invalid_size",
            Self::InvalidPrice(_) => "invalid_price",
            Self::MinNotional(_) => "min_notional",
            Self::MissingInstrument(_) => "missing_instrument",
            Self::DuplicateOrder(_) => "duplicate_order",
            Self::OrderNotFound(_) => "order_not_found",
            Self::PositionMissing(_) => "position_missing",
            Self::KillSwitchActive(_) => "kill_switch_active",
            Self::TradingDisabled => "trading_disabled",
            Self::RiskLimitBreach(_) => "risk_limit_breach",
            Self::Internal(_) => "internal_error",
        }
    }

    /// True for the transport family that is safe to retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::Server(_)
        )
    }

    /// Auth errors count toward the consecutive-error threshold that can
    /// trip the kill switch.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::Auth(_) | Self::SignatureMismatch(_) | Self::SignTypeMissing
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Rejection reasons (decisions, not errors)
// =============================================================================

/// Why a candidate (or a whole tick) was rejected by the meta-layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RejectReason {
    MtfScoreBelowThreshold,
    NoTradeZoneSpread,
    NoTradeZoneAtr,
    OrderbookInvalid,
    DepthImbalanceExtreme,
    AnomalyBlock,
    AnomalyWick,
    AnomalyLowVolume,
    AnomalyGap,
    LiquidationWickFilter,
    TooManyErrors,
    MetaConflict,
    BelowAcceptanceFloor,
    Outscored,
    AllCandidatesRejected,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::MtfScoreBelowThreshold => "mtf_score_below_threshold",
            Self::NoTradeZoneSpread => "no_trade_zone_spread",
            Self::NoTradeZoneAtr => "no_trade_zone_atr",
            Self::OrderbookInvalid => "orderbook_invalid",
            Self::DepthImbalanceExtreme => "depth_imbalance_extreme",
            Self::AnomalyBlock => "anomaly_block",
            Self::AnomalyWick => "anomaly_wick",
            Self::AnomalyLowVolume => "anomaly_low_volume",
            Self::AnomalyGap => "anomaly_gap",
            Self::LiquidationWickFilter => "liquidation_wick_filter",
            Self::TooManyErrors => "too_many_errors",
            Self::MetaConflict => "meta_conflict",
            Self::BelowAcceptanceFloor => "below_acceptance_floor",
            Self::Outscored => "outscored",
            Self::AllCandidatesRejected => "all_candidates_rejected",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_snake_case_and_stable() {
        assert_eq!(EngineError::Timeout("x".into()).kind(), "timeout");
        assert_eq!(EngineError::SignTypeMissing.kind(), "sign_type_missing");
        assert_eq!(EngineError::TradingDisabled.kind(), "trading_disabled");
        assert_eq!(
            EngineError::MinNotional("x".into()).kind(),
            "min_notional"
        );
    }

    #[test]
    fn transient_family() {
        assert!(EngineError::Network("x".into()).is_transient());
        assert!(EngineError::RateLimited("x".into()).is_transient());
        assert!(!EngineError::Auth("x".into()).is_transient());
        assert!(!EngineError::InvalidSize("x".into()).is_transient());
    }

    #[test]
    fn reject_codes() {
        assert_eq!(RejectReason::MetaConflict.code(), "meta_conflict");
        assert_eq!(
            RejectReason::AllCandidatesRejected.code(),
            "all_candidates_rejected"
        );
        assert_eq!(RejectReason::AnomalyWick.code(), "anomaly_wick");
    }
}
