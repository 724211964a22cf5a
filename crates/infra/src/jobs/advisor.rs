//! Static advice on job submission parameters.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::types::JobSubmission;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipCategory {
    Memory,
    Gpu,
    Runtime,
    RfiStrategy,
    Cost,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationTip {
    pub category: TipCategory,
    pub severity: TipSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_value: Option<JsonValue>,
}

const GPU_COST_WARNING_THRESHOLD: u32 = 4;

/// Tips for a submission, in a stable order. Never touches state.
pub fn optimization_tips(submission: &JobSubmission) -> Vec<OptimizationTip> {
    let mut tips = Vec::new();

    match submission.gpu_count() {
        None | Some(0) => tips.push(OptimizationTip {
            category: TipCategory::Gpu,
            severity: TipSeverity::Warning,
            message: "GPU count not specified. Recommend at least 1 GPU for image reconstruction."
                .to_string(),
            suggested_value: Some(JsonValue::from(2)),
        }),
        Some(gpus) if gpus > GPU_COST_WARNING_THRESHOLD => tips.push(OptimizationTip {
            category: TipCategory::Cost,
            severity: TipSeverity::Info,
            message: format!(
                "Using {gpus} GPUs will increase compute cost. Verify parallelization benefit."
            ),
            suggested_value: None,
        }),
        Some(_) => {}
    }

    match submission.rfi_strategy() {
        None | Some("") => tips.push(OptimizationTip {
            category: TipCategory::RfiStrategy,
            severity: TipSeverity::Warning,
            message: "RFI strategy not specified. Recommend \"medium\" for balanced accuracy and performance."
                .to_string(),
            suggested_value: Some(JsonValue::from("medium")),
        }),
        Some("high") | Some("high_sensitivity") => tips.push(OptimizationTip {
            category: TipCategory::Runtime,
            severity: TipSeverity::Info,
            message: "High RFI strategy will increase runtime. Expected 2-3x longer processing time."
                .to_string(),
            suggested_value: None,
        }),
        Some(_) => {}
    }

    if !submission.has_max_runtime() {
        tips.push(OptimizationTip {
            category: TipCategory::Runtime,
            severity: TipSeverity::Info,
            message: "No max runtime specified. Recommend 24-48 hours for large datasets.".to_string(),
            suggested_value: Some(JsonValue::from("48h")),
        });
    }

    tips
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::Agent;

    #[test]
    fn bare_submission_gets_three_tips() {
        let tips = optimization_tips(&JobSubmission::new(Agent::AlphaCal, "d"));
        let summary: Vec<_> = tips.iter().map(|t| (t.category, t.severity)).collect();
        assert_eq!(
            summary,
            vec![
                (TipCategory::Gpu, TipSeverity::Warning),
                (TipCategory::RfiStrategy, TipSeverity::Warning),
                (TipCategory::Runtime, TipSeverity::Info),
            ]
        );
        assert_eq!(tips[0].suggested_value, Some(JsonValue::from(2)));
        assert_eq!(tips[2].suggested_value, Some(JsonValue::from("48h")));
    }

    #[test]
    fn many_gpus_and_high_rfi_are_informational() {
        let submission = JobSubmission::new(Agent::ImageReconstruction, "d")
            .with_param("gpu_count", 8)
            .with_param("rfi_strategy", "high_sensitivity")
            .with_param("max_runtime", "12h");
        let tips = optimization_tips(&submission);

        assert_eq!(tips.len(), 2);
        assert_eq!(tips[0].category, TipCategory::Cost);
        assert!(tips[0].message.contains("8 GPUs"));
        assert_eq!(tips[1].category, TipCategory::Runtime);
        assert!(tips.iter().all(|t| t.severity == TipSeverity::Info));
    }

    #[test]
    fn well_formed_submission_needs_no_advice() {
        let submission = JobSubmission::new(Agent::AlphaCal, "d")
            .with_param("gpu_count", 2)
            .with_param("rfi_strategy", "medium")
            .with_param("max_runtime", "24h");
        assert!(optimization_tips(&submission).is_empty());
    }

    #[test]
    fn zero_gpus_is_treated_as_missing() {
        let submission = JobSubmission::new(Agent::AlphaCal, "d").with_param("gpu_count", 0);
        assert_eq!(optimization_tips(&submission)[0].category, TipCategory::Gpu);
    }
}
