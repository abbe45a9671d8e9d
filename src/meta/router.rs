// =============================================================================
// Weighted router — confidence scaling, regime weights, MTF multiplier
// =============================================================================
//
// For each surviving candidate:
//
//   scaled = clamp(a * raw + b, 0, 1)          per-strategy / per-symbol
//   final  = scaled * weight[regime][strategy] * mtf_multiplier
//   mtf_multiplier = clamp(mtf_a * mtf_score + mtf_b, 0, 1)
//
// Opposite-direction candidates on one tick cancel each other (meta_conflict)
// before any scoring. The winner is the highest final that clears the
// acceptance floor; ties go to the higher raw confidence. The full candidate
// list with every intermediate number lands in the DecisionRecord.
// =============================================================================

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ConfigManager;
use crate::errors::RejectReason;
use crate::market_data::MtfScore;
use crate::meta::regime::RegimeAssessment;
use crate::strategy::SignalProposal;
use crate::types::Direction;

/// Affine calibration coefficients.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScalingCoeffs {
    pub a: f64,
    pub b: f64,
}

impl Default for ScalingCoeffs {
    fn default() -> Self {
        Self { a: 1.0, b: 0.0 }
    }
}

/// Per-strategy (optionally per-symbol) confidence calibration, read live
/// from the config document.
pub struct ConfidenceScaler {
    cfg: Arc<ConfigManager>,
}

impl ConfidenceScaler {
    pub fn new(cfg: Arc<ConfigManager>) -> Self {
        Self { cfg }
    }

    fn coeffs(&self, strategy: &str, symbol: &str) -> ScalingCoeffs {
        // Most specific wins: per-symbol override, then per-strategy, then
        // the default.
        let paths = [
            format!("meta.scaling.{strategy}.symbols.{symbol}"),
            format!("meta.scaling.{strategy}"),
            "meta.scaling.default".to_string(),
        ];
        for p in &paths {
            let a = self.cfg.get(&format!("{p}.a")).and_then(|v| v.as_f64());
            let b = self.cfg.get(&format!("{p}.b")).and_then(|v| v.as_f64());
            if let (Some(a), Some(b)) = (a, b) {
                return ScalingCoeffs { a, b };
            }
        }
        ScalingCoeffs::default()
    }

    pub fn scale(&self, strategy: &str, symbol: &str, raw: f64) -> f64 {
        let c = self.coeffs(strategy, symbol);
        (c.a * raw + c.b).clamp(0.0, 1.0)
    }
}

/// Routing knobs, read from config by the caller once per tick.
#[derive(Debug, Clone, Copy)]
pub struct RouterParams {
    pub acceptance_floor: f64,
    pub mtf_threshold: f64,
    pub mtf_a: f64,
    pub mtf_b: f64,
}

impl Default for RouterParams {
    fn default() -> Self {
        Self {
            acceptance_floor: 0.25,
            mtf_threshold: 0.5,
            mtf_a: 0.6,
            mtf_b: 0.4,
        }
    }
}

/// One candidate's complete scoring trail.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    pub strategy: String,
    pub direction: Direction,
    pub raw: f64,
    pub scaled: f64,
    pub weight: f64,
    pub mtf_multiplier: f64,
    pub final_score: f64,
    pub rejected: bool,
    pub reasons: Vec<String>,
}

/// The structured record every routing pass emits.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub symbol: String,
    pub regime: String,
    pub regime_scores: crate::meta::regime::RegimeScores,
    pub mtf_score: f64,
    pub mtf_breakdown: std::collections::BTreeMap<String, f64>,
    pub candidates: Vec<CandidateRecord>,
    pub selected: Option<String>,
    /// Set when every candidate was rejected.
    pub rejection: Option<String>,
    pub created_at: String,
}

pub struct WeightedRouter {
    cfg: Arc<ConfigManager>,
    scaler: ConfidenceScaler,
}

impl WeightedRouter {
    pub fn new(cfg: Arc<ConfigManager>) -> Self {
        let scaler = ConfidenceScaler::new(cfg.clone());
        Self { cfg, scaler }
    }

    fn weight(&self, regime_code: &str, strategy: &str) -> f64 {
        self.cfg
            .f64(&format!("meta.weights.{regime_code}.{strategy}"), 1.0)
    }

    /// Route a tick's candidates. Returns the decision record and the
    /// winning proposal, if any.
    pub fn route(
        &self,
        symbol: &str,
        proposals: Vec<SignalProposal>,
        regime: &RegimeAssessment,
        mtf: &MtfScore,
        params: &RouterParams,
    ) -> (DecisionRecord, Option<SignalProposal>) {
        let regime_code = regime.label.code();
        let mtf_multiplier = (params.mtf_a * mtf.score + params.mtf_b).clamp(0.0, 1.0);
        let mtf_weak = mtf.score < params.mtf_threshold;

        // --- Conflict detection across the tick's candidates ----------------
        let has_long = proposals
            .iter()
            .any(|p| p.direction == Direction::Long || p.direction == Direction::CloseShort);
        let has_short = proposals
            .iter()
            .any(|p| p.direction == Direction::Short || p.direction == Direction::CloseLong);
        let conflict = has_long && has_short;

        let mut candidates = Vec::with_capacity(proposals.len());
        let mut best: Option<(usize, f64, f64)> = None; // (index, final, raw)

        for (idx, p) in proposals.iter().enumerate() {
            let scaled = self.scaler.scale(&p.strategy, symbol, p.confidence);
            let weight = self.weight(regime_code, &p.strategy);
            let final_score = scaled * weight * mtf_multiplier;

            let mut reasons: Vec<String> = Vec::new();
            let mut rejected = false;

            if conflict {
                rejected = true;
                reasons.push(RejectReason::MetaConflict.code().to_string());
            } else if final_score < params.acceptance_floor {
                rejected = true;
                reasons.push(RejectReason::BelowAcceptanceFloor.code().to_string());
                if mtf_weak {
                    reasons.push(RejectReason::MtfScoreBelowThreshold.code().to_string());
                }
            }

            if !rejected {
                let better = match best {
                    None => true,
                    Some((_, best_final, best_raw)) => {
                        final_score > best_final
                            || ((final_score - best_final).abs() < 1e-12
                                && p.confidence > best_raw)
                    }
                };
                if better {
                    best = Some((idx, final_score, p.confidence));
                }
            }

            candidates.push(CandidateRecord {
                strategy: p.strategy.clone(),
                direction: p.direction,
                raw: p.confidence,
                scaled,
                weight,
                mtf_multiplier,
                final_score,
                rejected,
                reasons,
            });
        }

        // Losers that merely scored lower than the winner.
        if let Some((winner_idx, _, _)) = best {
            for (idx, c) in candidates.iter_mut().enumerate() {
                if idx != winner_idx && !c.rejected {
                    c.rejected = true;
                    c.reasons.push(RejectReason::Outscored.code().to_string());
                }
            }
        }

        let selected = best.map(|(idx, _, _)| proposals[idx].strategy.clone());
        let rejection = if selected.is_none() && !candidates.is_empty() {
            Some(RejectReason::AllCandidatesRejected.code().to_string())
        } else {
            None
        };

        let record = DecisionRecord {
            symbol: symbol.to_string(),
            regime: regime_code.to_string(),
            regime_scores: regime.scores,
            mtf_score: mtf.score,
            mtf_breakdown: mtf.breakdown.clone(),
            candidates,
            selected: selected.clone(),
            rejection,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        match &selected {
            Some(name) => info!(
                symbol,
                regime = regime_code,
                strategy = %name,
                mtf_score = format!("{:.3}", mtf.score),
                candidates = record.candidates.len(),
                "router selected candidate"
            ),
            None => debug!(
                symbol,
                regime = regime_code,
                candidates = record.candidates.len(),
                rejection = ?record.rejection,
                "router rejected all candidates"
            ),
        }

        let winner = best.map(|(idx, _, _)| proposals.into_iter().nth(idx)).flatten();
        (record, winner)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::regime::{RegimeLabel, RegimeScores};
    use crate::strategy::EntryMode;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn regime(label: RegimeLabel) -> RegimeAssessment {
        RegimeAssessment {
            label,
            scores: RegimeScores {
                trend: 0.8,
                range: 0.2,
                volatility: 0.3,
                chop: 0.1,
            },
            atr_pct: Some(1.0),
            extreme_atr: false,
        }
    }

    fn mtf(score: f64) -> MtfScore {
        MtfScore {
            score,
            breakdown: BTreeMap::new(),
        }
    }

    fn proposal(strategy: &str, direction: Direction, raw: f64) -> SignalProposal {
        SignalProposal::new(strategy, "BTCUSDT", direction, raw, EntryMode::Immediate)
    }

    /// MTF multiplier of exactly 0.85 and identity scaling, per the
    /// weighted-routing scenario.
    fn params_identity() -> RouterParams {
        RouterParams {
            acceptance_floor: 0.1,
            mtf_threshold: 0.5,
            // clamp(a*score + b): with score 0.75 -> 0.6*0.75 + 0.4 = 0.85
            mtf_a: 0.6,
            mtf_b: 0.4,
        }
    }

    #[test]
    fn weighted_routing_in_trend() {
        let cfg = Arc::new(ConfigManager::in_memory());
        let router = WeightedRouter::new(cfg);

        let proposals = vec![
            proposal("trend_pullback", Direction::Long, 0.70),
            proposal("mean_reversion", Direction::Long, 0.65),
        ];
        let (record, winner) = router.route(
            "BTCUSDT",
            proposals,
            &regime(RegimeLabel::TrendUp),
            &mtf(0.75),
            &params_identity(),
        );

        let winner = winner.expect("trend_pullback must win");
        assert_eq!(winner.strategy, "trend_pullback");
        assert_eq!(record.selected.as_deref(), Some("trend_pullback"));

        // Finals: 0.70 * 1.5 * 0.85 = 0.8925 and 0.65 * 0.3 * 0.85 = 0.16575.
        let tp = record
            .candidates
            .iter()
            .find(|c| c.strategy == "trend_pullback")
            .unwrap();
        let mr = record
            .candidates
            .iter()
            .find(|c| c.strategy == "mean_reversion")
            .unwrap();
        assert!((tp.final_score - 0.8925).abs() < 1e-3);
        assert!((mr.final_score - 0.16575).abs() < 1e-3);
        assert!(!tp.rejected);
        assert!(mr.rejected);
        assert!(!mr.reasons.is_empty(), "loser carries a rejection reason");
    }

    #[test]
    fn conflicting_directions_reject_everything() {
        let cfg = Arc::new(ConfigManager::in_memory());
        let router = WeightedRouter::new(cfg);

        let proposals = vec![
            proposal("trend_pullback", Direction::Long, 0.9),
            proposal("mean_reversion", Direction::Short, 0.9),
        ];
        let (record, winner) = router.route(
            "BTCUSDT",
            proposals,
            &regime(RegimeLabel::TrendUp),
            &mtf(0.9),
            &params_identity(),
        );

        assert!(winner.is_none());
        assert_eq!(
            record.rejection.as_deref(),
            Some("all_candidates_rejected")
        );
        for c in &record.candidates {
            assert!(c.rejected);
            assert!(c.reasons.iter().any(|r| r == "meta_conflict"));
        }
    }

    #[test]
    fn acceptance_floor_rejects_weak_finals() {
        let cfg = Arc::new(ConfigManager::in_memory());
        let router = WeightedRouter::new(cfg);

        // mean_reversion in trend_up is weighted 0.3: 0.5*0.3*0.85 = 0.1275
        let proposals = vec![proposal("mean_reversion", Direction::Long, 0.5)];
        let (record, winner) = router.route(
            "BTCUSDT",
            proposals,
            &regime(RegimeLabel::TrendUp),
            &mtf(0.75),
            &RouterParams {
                acceptance_floor: 0.25,
                ..params_identity()
            },
        );
        assert!(winner.is_none());
        let c = &record.candidates[0];
        assert!(c.rejected);
        assert!(c.reasons.iter().any(|r| r == "below_acceptance_floor"));
    }

    #[test]
    fn weak_mtf_reason_recorded_but_never_hard_rejects_alone() {
        let cfg = Arc::new(ConfigManager::in_memory());
        let router = WeightedRouter::new(cfg);

        // Strong candidate survives a weak MTF because the multiplier is
        // soft: 0.9 * 1.5 * clamp(0.6*0.2+0.4) = 0.9*1.5*0.52 = 0.702.
        let strong = vec![proposal("trend_pullback", Direction::Long, 0.9)];
        let (_, winner) = router.route(
            "BTCUSDT",
            strong,
            &regime(RegimeLabel::TrendUp),
            &mtf(0.2),
            &params_identity(),
        );
        assert!(winner.is_some(), "weak MTF alone must not hard-reject");

        // A weak candidate under weak MTF records the MTF reason.
        let weak = vec![proposal("mean_reversion", Direction::Long, 0.5)];
        let (record, winner) = router.route(
            "BTCUSDT",
            weak,
            &regime(RegimeLabel::TrendUp),
            &mtf(0.2),
            &RouterParams {
                acceptance_floor: 0.25,
                ..params_identity()
            },
        );
        assert!(winner.is_none());
        assert!(record.candidates[0]
            .reasons
            .iter()
            .any(|r| r == "mtf_score_below_threshold"));
    }

    #[test]
    fn tie_breaks_on_higher_raw_confidence() {
        let cfg = ConfigManager::in_memory();
        // Equal weights so finals tie when scaled values tie. Scale
        // trend_pullback down so both land on scaled 0.6 with different
        // raws: 0.75 * 0.8 = 0.6 vs 0.6 * 1.0 = 0.6.
        cfg.set("meta.weights.range.trend_pullback", json!(1.0));
        cfg.set("meta.weights.range.mean_reversion", json!(1.0));
        cfg.set("meta.scaling.trend_pullback.a", json!(0.8));
        cfg.set("meta.scaling.trend_pullback.b", json!(0.0));
        let router = WeightedRouter::new(Arc::new(cfg));

        let proposals = vec![
            proposal("trend_pullback", Direction::Long, 0.75),
            proposal("mean_reversion", Direction::Long, 0.6),
        ];
        let (_, winner) = router.route(
            "BTCUSDT",
            proposals,
            &regime(RegimeLabel::Range),
            &mtf(1.0),
            &RouterParams {
                acceptance_floor: 0.1,
                mtf_threshold: 0.5,
                mtf_a: 0.0,
                mtf_b: 1.0,
            },
        );
        // Finals tie at 0.6; trend_pullback has the higher raw (0.75).
        assert_eq!(winner.unwrap().strategy, "trend_pullback");
    }

    #[test]
    fn per_symbol_scaling_override_applies() {
        let cfg = ConfigManager::in_memory();
        cfg.set("meta.scaling.mean_reversion.symbols.BTCUSDT.a", json!(0.5));
        cfg.set("meta.scaling.mean_reversion.symbols.BTCUSDT.b", json!(0.1));
        let scaler = ConfidenceScaler::new(Arc::new(cfg));
        // BTCUSDT uses the override: 0.5*0.8 + 0.1 = 0.5
        assert!((scaler.scale("mean_reversion", "BTCUSDT", 0.8) - 0.5).abs() < 1e-9);
        // Other symbols fall through to the default identity.
        assert!((scaler.scale("mean_reversion", "ETHUSDT", 0.8) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn scaled_confidence_is_clamped() {
        let cfg = ConfigManager::in_memory();
        cfg.set("meta.scaling.vol_breakout.a", json!(2.0));
        cfg.set("meta.scaling.vol_breakout.b", json!(0.5));
        let scaler = ConfidenceScaler::new(Arc::new(cfg));
        assert_eq!(scaler.scale("vol_breakout", "BTCUSDT", 0.9), 1.0);
    }
}
