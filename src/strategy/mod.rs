// =============================================================================
// Strategy interface — polymorphic signal producers
// =============================================================================
//
// A strategy looks at a feature frame (closed bars only) and optionally
// returns a proposal. Proposals are pure values: no I/O, no mutation of the
// frame. "No signal" is `None`, never an error. Strategies must tolerate
// missing optional features (orderflow, derivatives) by degrading.

pub mod factory;
pub mod mean_reversion;
pub mod trend_pullback;
pub mod vol_breakout;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::features::FeatureFrame;
use crate::types::Direction;

pub use factory::StrategyFactory;
pub use mean_reversion::MeanReversion;
pub use trend_pullback::TrendPullback;
pub use vol_breakout::VolBreakout;

/// How the entry should be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryMode {
    /// Fire as soon as the setup triggers on the current closed bar.
    Immediate,
    /// Require a rejection pattern: previous bar closed on one side of the
    /// reference level, current bar closed on the other.
    ConfirmClose,
    /// Rest a limit order at a reference price with a TTL in bars.
    LimitRetest,
}

/// Limit-order hint emitted with `LimitRetest` entries.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LimitHint {
    pub price: f64,
    pub ttl_bars: u32,
}

/// Exit rules a strategy may attach to its proposal. The engine honors each
/// with the matching exit_reason code.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum ExitRule {
    /// Close after at most `max_bars` bars in the position.
    TimeStop { max_bars: u32 },
    /// Stop at `mult` ATRs from entry (overrides the default k_sl).
    AtrStop { mult: f64 },
    /// Take profit at a reference price (e.g. the band midline).
    TakeProfitAt { price: f64 },
}

impl ExitRule {
    pub fn exit_reason(&self) -> &'static str {
        match self {
            Self::TimeStop { .. } => "time_stop",
            Self::AtrStop { .. } => "sl_hit",
            Self::TakeProfitAt { .. } => "tp_hit",
        }
    }
}

/// Strategy output: a trade the strategy would take, with its evidence.
#[derive(Debug, Clone, Serialize)]
pub struct SignalProposal {
    pub strategy: String,
    pub symbol: String,
    pub direction: Direction,
    /// Raw confidence in [0, 1] before meta-layer calibration.
    pub confidence: f64,
    /// Stable snake_case reason codes explaining the proposal.
    pub reasons: Vec<String>,
    /// Named numeric inputs behind the decision.
    pub values: BTreeMap<String, f64>,
    pub entry_mode: EntryMode,
    pub limit_hint: Option<LimitHint>,
    pub exit_rules: Vec<ExitRule>,
}

impl SignalProposal {
    pub fn new(
        strategy: &str,
        symbol: &str,
        direction: Direction,
        confidence: f64,
        entry_mode: EntryMode,
    ) -> Self {
        Self {
            strategy: strategy.to_string(),
            symbol: symbol.to_string(),
            direction,
            confidence: confidence.clamp(0.0, 1.0),
            reasons: Vec::new(),
            values: BTreeMap::new(),
            entry_mode,
            limit_hint: None,
            exit_rules: Vec::new(),
        }
    }

    pub fn reason(mut self, code: &str) -> Self {
        self.reasons.push(code.to_string());
        self
    }

    pub fn value(mut self, name: &str, v: f64) -> Self {
        self.values.insert(name.to_string(), v);
        self
    }

    pub fn limit(mut self, price: f64, ttl_bars: u32) -> Self {
        self.limit_hint = Some(LimitHint { price, ttl_bars });
        self
    }

    pub fn exit(mut self, rule: ExitRule) -> Self {
        self.exit_rules.push(rule);
        self
    }
}

/// The polymorphic strategy capability.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Inspect the frame and optionally propose a trade. Must be pure with
    /// respect to the frame and use only closed bars.
    fn generate_signal(&mut self, frame: &FeatureFrame) -> Option<SignalProposal>;
}
