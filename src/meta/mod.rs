// =============================================================================
// Meta-layer — regime scoring, hygiene gates, confidence scaling, routing
// =============================================================================
//
// Runs on every tick, in order:
//   1. RegimeScorer  — continuous scores + dominant label
//   2. HygieneFilter — data-quality / market-condition no-trade zones
//   3. Candidate collection + conflict detection
//   4. ConfidenceScaler — per-strategy affine calibration
//   5. WeightedRouter — regime weights x MTF multiplier, acceptance floor
//
// Every step logs its inputs and decision; the final DecisionRecord carries
// the full candidate list for auditing.

pub mod hygiene;
pub mod regime;
pub mod router;

pub use hygiene::{HygieneFilter, HygieneParams, HygieneVerdict};
pub use regime::{RegimeAssessment, RegimeLabel, RegimeScorer, RegimeScores};
pub use router::{
    CandidateRecord, ConfidenceScaler, DecisionRecord, RouterParams, WeightedRouter,
};
