//! Technical evaluation rubric (7 axes, weights 20/20/15/15/10/10/10).

use super::{AxisSpec, ParseOutcome, Rubric, RubricParser, ScoreCheck, weighted_total};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

pub const TECHNICAL_RUBRIC: Rubric = Rubric {
    name: "technical",
    axes: &[
        AxisSpec {
            key: "technicalNovelty",
            label: "技術的新規性",
            weight: 20,
        },
        AxisSpec {
            key: "patentability",
            label: "特許性",
            weight: 20,
        },
        AxisSpec {
            key: "implementationDifficulty",
            label: "実装難易度",
            weight: 15,
        },
        AxisSpec {
            key: "competitiveTechnology",
            label: "競合技術比較",
            weight: 15,
        },
        AxisSpec {
            key: "scalability",
            label: "スケーラビリティ",
            weight: 10,
        },
        AxisSpec {
            key: "resourceFit",
            label: "資源適合性",
            weight: 10,
        },
        AxisSpec {
            key: "timeToMarket",
            label: "開発期間",
            weight: 10,
        },
    ],
    verdict_label: "総合判定",
    verdicts: &["優先度高", "優先度中", "優先度低"],
    total_label: "総合スコア",
};

static PARSER: LazyLock<RubricParser> = LazyLock::new(|| RubricParser::new(TECHNICAL_RUBRIC));

/// Development priority given by a technical evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TechnicalVerdict {
    #[serde(rename = "優先度高")]
    High,
    #[serde(rename = "優先度中")]
    Medium,
    #[serde(rename = "優先度低")]
    Low,
}

impl TechnicalVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            TechnicalVerdict::High => "優先度高",
            TechnicalVerdict::Medium => "優先度中",
            TechnicalVerdict::Low => "優先度低",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "優先度高" => Some(TechnicalVerdict::High),
            "優先度中" => Some(TechnicalVerdict::Medium),
            "優先度低" => Some(TechnicalVerdict::Low),
            _ => None,
        }
    }
}

impl fmt::Display for TechnicalVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnicalScores {
    pub technical_novelty: Option<u8>,
    pub patentability: Option<u8>,
    pub implementation_difficulty: Option<u8>,
    pub competitive_technology: Option<u8>,
    pub scalability: Option<u8>,
    pub resource_fit: Option<u8>,
    pub time_to_market: Option<u8>,
    pub verdict: Option<TechnicalVerdict>,
    pub total_score: Option<f64>,
}

impl TechnicalScores {
    pub fn axis_scores(&self) -> [Option<u8>; 7] {
        [
            self.technical_novelty,
            self.patentability,
            self.implementation_difficulty,
            self.competitive_technology,
            self.scalability,
            self.resource_fit,
            self.time_to_market,
        ]
    }

    pub fn computed_total(&self) -> Option<f64> {
        weighted_total(&self.axis_scores(), &TECHNICAL_RUBRIC.weights())
    }

    pub fn check(&self) -> ScoreCheck {
        ScoreCheck::new(self.total_score, self.computed_total())
    }
}

/// Parse a technical evaluation report.
pub fn parse_technical_scores(report: &str) -> ParseOutcome<TechnicalScores> {
    let fields = PARSER.parse(report);
    let s = &fields.scores;
    let data = TechnicalScores {
        technical_novelty: s[0],
        patentability: s[1],
        implementation_difficulty: s[2],
        competitive_technology: s[3],
        scalability: s[4],
        resource_fit: s[5],
        time_to_market: s[6],
        verdict: fields.verdict.and_then(TechnicalVerdict::from_label),
        total_score: fields.total,
    };
    ParseOutcome::new(data, fields.errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_sum_to_100() {
        assert_eq!(TECHNICAL_RUBRIC.weights().iter().sum::<u32>(), 100);
        assert_eq!(TECHNICAL_RUBRIC.axes.len(), 7);
    }

    #[test]
    fn test_parse_markdown_table() {
        let report = "\
| 評価軸 | スコア |
|---|---|
| 技術的新規性 | 5 |
| 特許性 | 4 |
| 実装難易度 | 3 |
| 競合技術比較 | 4 |
| スケーラビリティ | 2 |
| 資源適合性 | 5 |
| 開発期間 | 3 |

**総合スコア**: 80.0
**総合判定**: 優先度高
";
        let outcome = parse_technical_scores(report);
        assert!(outcome.success, "{:?}", outcome.errors);
        assert_eq!(
            outcome.data.axis_scores(),
            [Some(5), Some(4), Some(3), Some(4), Some(2), Some(5), Some(3)]
        );
        assert_eq!(outcome.data.verdict, Some(TechnicalVerdict::High));
        // 100 + 80 + 45 + 60 + 20 + 50 + 30 = 385 → 77.0
        assert_eq!(outcome.data.computed_total(), Some(77.0));
        assert!(!outcome.data.check().is_consistent());
    }

    #[test]
    fn test_full_width_scores() {
        let outcome = parse_technical_scores("特許性（20％）：【４】\n開発期間：［１］");
        assert_eq!(outcome.data.patentability, Some(4));
        assert_eq!(outcome.data.time_to_market, Some(1));
    }

    #[test]
    fn test_partial_data_is_returned() {
        let outcome = parse_technical_scores("特許性：3\n総合判定：優先度低");
        assert!(!outcome.success);
        assert_eq!(outcome.data.patentability, Some(3));
        assert_eq!(outcome.data.verdict, Some(TechnicalVerdict::Low));
        assert_eq!(outcome.data.computed_total(), None);
        // six missing axes plus the total
        assert_eq!(outcome.errors.len(), 7);
    }
}
