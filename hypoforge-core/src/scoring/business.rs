//! Business evaluation rubric (8 axes, weights 20/15/20/20/10/5/5/5).

use super::{AxisSpec, ParseOutcome, Rubric, RubricParser, ScoreCheck, weighted_total};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

pub const BUSINESS_RUBRIC: Rubric = Rubric {
    name: "business",
    axes: &[
        AxisSpec {
            key: "marketSize",
            label: "市場規模",
            weight: 20,
        },
        AxisSpec {
            key: "manufacturingFeasibility",
            label: "製造実現性",
            weight: 15,
        },
        AxisSpec {
            key: "technicalAdvantage",
            label: "技術優位性",
            weight: 20,
        },
        AxisSpec {
            key: "profitability",
            label: "収益性",
            weight: 20,
        },
        AxisSpec {
            key: "competitivePosition",
            label: "競合優位性",
            weight: 10,
        },
        AxisSpec {
            key: "entryBarrier",
            label: "参入障壁",
            weight: 5,
        },
        AxisSpec {
            key: "regulatoryRisk",
            label: "規制リスク",
            weight: 5,
        },
        AxisSpec {
            key: "strategicFit",
            label: "戦略適合性",
            weight: 5,
        },
    ],
    verdict_label: "総合判定",
    verdicts: &["推進", "条件付き推進", "見送り"],
    total_label: "総合スコア",
};

static PARSER: LazyLock<RubricParser> = LazyLock::new(|| RubricParser::new(BUSINESS_RUBRIC));

/// Recommendation given by a business evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusinessVerdict {
    #[serde(rename = "推進")]
    Proceed,
    #[serde(rename = "条件付き推進")]
    ConditionalProceed,
    #[serde(rename = "見送り")]
    Decline,
}

impl BusinessVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            BusinessVerdict::Proceed => "推進",
            BusinessVerdict::ConditionalProceed => "条件付き推進",
            BusinessVerdict::Decline => "見送り",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "推進" => Some(BusinessVerdict::Proceed),
            "条件付き推進" => Some(BusinessVerdict::ConditionalProceed),
            "見送り" => Some(BusinessVerdict::Decline),
            _ => None,
        }
    }
}

impl fmt::Display for BusinessVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scores parsed from a business evaluation report. `None` means the value
/// was missing or invalid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessScores {
    pub market_size: Option<u8>,
    pub manufacturing_feasibility: Option<u8>,
    pub technical_advantage: Option<u8>,
    pub profitability: Option<u8>,
    pub competitive_position: Option<u8>,
    pub entry_barrier: Option<u8>,
    pub regulatory_risk: Option<u8>,
    pub strategic_fit: Option<u8>,
    pub verdict: Option<BusinessVerdict>,
    /// Weighted total as stated by the report itself.
    pub total_score: Option<f64>,
}

impl BusinessScores {
    /// Axis scores in rubric order.
    pub fn axis_scores(&self) -> [Option<u8>; 8] {
        [
            self.market_size,
            self.manufacturing_feasibility,
            self.technical_advantage,
            self.profitability,
            self.competitive_position,
            self.entry_barrier,
            self.regulatory_risk,
            self.strategic_fit,
        ]
    }

    pub fn computed_total(&self) -> Option<f64> {
        weighted_total(&self.axis_scores(), &BUSINESS_RUBRIC.weights())
    }

    pub fn check(&self) -> ScoreCheck {
        ScoreCheck::new(self.total_score, self.computed_total())
    }
}

/// Parse a business evaluation report.
pub fn parse_business_scores(report: &str) -> ParseOutcome<BusinessScores> {
    let fields = PARSER.parse(report);
    let s = &fields.scores;
    let data = BusinessScores {
        market_size: s[0],
        manufacturing_feasibility: s[1],
        technical_advantage: s[2],
        profitability: s[3],
        competitive_position: s[4],
        entry_barrier: s[5],
        regulatory_risk: s[6],
        strategic_fit: s[7],
        verdict: fields.verdict.and_then(BusinessVerdict::from_label),
        total_score: fields.total,
    };
    ParseOutcome::new(data, fields.errors)
}
