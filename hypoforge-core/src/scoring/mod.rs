//! Structured score parsers for the two evaluation rubrics.
//!
//! Evaluation stages return free-text reports. The parsers here locate each
//! rubric axis by its fixed label, pull out the 1-5 score next to it, and
//! extract the categorical verdict and the report's own weighted total.
//! Parsing never fails outright: whatever was found is returned along with
//! one error per missing or invalid field.
//!
//! `weighted_total` recomputes the total from the per-axis scores so callers
//! can detect reports whose claimed total disagrees with their own numbers.

pub mod business;
pub mod technical;

pub use business::{BusinessScores, BusinessVerdict, parse_business_scores};
pub use technical::{TechnicalScores, TechnicalVerdict, parse_technical_scores};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lowest valid per-axis score.
pub const MIN_AXIS_SCORE: u8 = 1;
/// Highest valid per-axis score.
pub const MAX_AXIS_SCORE: u8 = 5;
/// Largest difference between a claimed and a recomputed total that still
/// counts as consistent.
pub const TOTAL_TOLERANCE: f64 = 0.5;

/// One axis of a rubric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisSpec {
    /// Field name used in serialized score records.
    pub key: &'static str,
    /// Label the report uses for the axis.
    pub label: &'static str,
    /// Weight in percent; the weights of a rubric sum to 100.
    pub weight: u32,
}

/// A fixed evaluation rubric: axes, verdict vocabulary and total label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rubric {
    pub name: &'static str,
    pub axes: &'static [AxisSpec],
    pub verdict_label: &'static str,
    pub verdicts: &'static [&'static str],
    pub total_label: &'static str,
}

impl Rubric {
    pub fn weights(&self) -> Vec<u32> {
        self.axes.iter().map(|axis| axis.weight).collect()
    }

    /// Output-format instructions appended to evaluation prompts so the
    /// report stays machine-readable.
    pub fn format_instructions(&self) -> String {
        let mut out = String::new();
        out.push_str("Score every axis from 1 to 5 using exactly these labels:\n");
        for axis in self.axes {
            out.push_str(&format!("{}（{}％）：［score］\n", axis.label, axis.weight));
        }
        out.push_str(&format!(
            "{}：{}\n",
            self.verdict_label,
            self.verdicts.join(" / ")
        ));
        out.push_str(&format!(
            "{}：round(Σ(weight × score) / 5, 1 decimal)\n",
            self.total_label
        ));
        out
    }
}

/// Result of a parse: the partial record plus one message per problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseOutcome<T> {
    pub success: bool,
    pub data: T,
    pub errors: Vec<String>,
}

impl<T> ParseOutcome<T> {
    pub fn new(data: T, errors: Vec<String>) -> Self {
        Self {
            success: errors.is_empty(),
            data,
            errors,
        }
    }
}

/// Raw fields located in a report, in rubric axis order.
#[derive(Debug, Clone, PartialEq)]
pub struct RubricFields {
    pub scores: Vec<Option<u8>>,
    pub verdict: Option<&'static str>,
    pub total: Option<f64>,
    pub errors: Vec<String>,
}

/// Compiled patterns for one rubric.
#[derive(Debug)]
pub struct RubricParser {
    rubric: Rubric,
    axis_patterns: Vec<Regex>,
    verdict_pattern: Regex,
    total_pattern: Regex,
}

impl RubricParser {
    pub fn new(rubric: Rubric) -> Self {
        let axis_patterns = rubric
            .axes
            .iter()
            .map(|axis| Regex::new(&axis_pattern(axis.label)).expect("axis pattern"))
            .collect();
        let verdict_pattern = Regex::new(&format!(
            r"{}[\s*|]*[：:]?[\s*|]*([^\n]*)",
            regex::escape(rubric.verdict_label)
        ))
        .expect("verdict pattern");
        let total_pattern = Regex::new(&format!(
            r"{}[\s*|]*(?:[（(][^）)\n]*[）)])?[^\d\n]*?(\d+(?:\.\d+)?)",
            regex::escape(rubric.total_label)
        ))
        .expect("total pattern");
        Self {
            rubric,
            axis_patterns,
            verdict_pattern,
            total_pattern,
        }
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    pub fn parse(&self, report: &str) -> RubricFields {
        let text = normalize_digits(report);
        let mut errors = Vec::new();

        let scores = self
            .rubric
            .axes
            .iter()
            .zip(&self.axis_patterns)
            .map(|(axis, pattern)| {
                let Some(caps) = pattern.captures(&text) else {
                    errors.push(format!("{} ({}): score not found", axis.label, axis.key));
                    return None;
                };
                match caps[1].parse::<u8>() {
                    Ok(value) if (MIN_AXIS_SCORE..=MAX_AXIS_SCORE).contains(&value) => Some(value),
                    _ => {
                        errors.push(format!(
                            "{} ({}): value {} is outside {}-{}",
                            axis.label, axis.key, &caps[1], MIN_AXIS_SCORE, MAX_AXIS_SCORE
                        ));
                        None
                    }
                }
            })
            .collect();

        let verdict = self.find_verdict(&text);
        if verdict.is_none() {
            errors.push(format!(
                "{}: expected one of {}",
                self.rubric.verdict_label,
                self.rubric.verdicts.join(", ")
            ));
        }

        let total = match self.total_pattern.captures(&text) {
            Some(caps) => match caps[1].parse::<f64>() {
                Ok(value) if (0.0..=100.0).contains(&value) => Some(value),
                _ => {
                    errors.push(format!(
                        "{}: value {} is outside 0-100",
                        self.rubric.total_label, &caps[1]
                    ));
                    None
                }
            },
            None => {
                errors.push(format!("{}: not found", self.rubric.total_label));
                None
            }
        };

        RubricFields {
            scores,
            verdict,
            total,
            errors,
        }
    }

    /// The verdict is the vocabulary entry appearing earliest after the
    /// label; on a tie the longer entry wins.
    fn find_verdict(&self, text: &str) -> Option<&'static str> {
        self.verdict_pattern.captures_iter(text).find_map(|caps| {
            let line = caps.get(1)?.as_str();
            self.rubric
                .verdicts
                .iter()
                .filter_map(|verdict| line.find(verdict).map(|pos| (pos, *verdict)))
                .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())))
                .map(|(_, verdict)| verdict)
        })
    }
}

/// Label, optional parenthesised weight, optional colon, optional bracket,
/// then the digits.
fn axis_pattern(label: &str) -> String {
    format!(
        r"{}[\s*|]*(?:[（(][^）)\n]*[）)])?[\s*|]*[：:]?[\s*|]*[［\[【]?\s*(\d+)",
        regex::escape(label)
    )
}

/// Replace full-width digits and the full-width full stop with ASCII.
pub fn normalize_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
            '．' => '.',
            _ => c,
        })
        .collect()
}

/// `round(Σ(weight × score) / 5, 1 decimal)`, or `None` when any score is
/// missing or the slices disagree in length.
pub fn weighted_total(scores: &[Option<u8>], weights: &[u32]) -> Option<f64> {
    if scores.len() != weights.len() {
        return None;
    }
    let mut sum = 0u32;
    for (score, weight) in scores.iter().zip(weights) {
        sum += u32::from((*score)?) * weight;
    }
    Some(round_one_decimal(f64::from(sum) / 5.0))
}

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Comparison of a report's claimed total with the recomputed one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreCheck {
    pub claimed: Option<f64>,
    pub computed: Option<f64>,
}

impl ScoreCheck {
    pub fn new(claimed: Option<f64>, computed: Option<f64>) -> Self {
        Self { claimed, computed }
    }

    /// True unless both totals are known and differ by more than
    /// `TOTAL_TOLERANCE`.
    pub fn is_consistent(&self) -> bool {
        match (self.claimed, self.computed) {
            (Some(claimed), Some(computed)) => (claimed - computed).abs() <= TOTAL_TOLERANCE,
            _ => true,
        }
    }

    pub fn warning(&self, rubric: &str) -> Option<String> {
        if self.is_consistent() {
            return None;
        }
        let (claimed, computed) = (self.claimed?, self.computed?);
        Some(format!(
            "{rubric}: report claims total {claimed:.1} but its axis scores give {computed:.1}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: Rubric = Rubric {
        name: "demo",
        axes: &[
            AxisSpec {
                key: "alpha",
                label: "アルファ",
                weight: 60,
            },
            AxisSpec {
                key: "beta",
                label: "ベータ",
                weight: 40,
            },
        ],
        verdict_label: "判定",
        verdicts: &["採用", "条件付き採用", "不採用"],
        total_label: "合計",
    };

    #[test]
    fn test_weighted_total_formula() {
        assert_eq!(weighted_total(&[Some(5), Some(5)], &[60, 40]), Some(100.0));
        assert_eq!(weighted_total(&[Some(3), Some(4)], &[60, 40]), Some(68.0));
        assert_eq!(weighted_total(&[Some(1)], &[7]), Some(1.4));
    }

    #[test]
    fn test_weighted_total_missing_axis() {
        assert_eq!(weighted_total(&[Some(3), None], &[60, 40]), None);
        assert_eq!(weighted_total(&[Some(3)], &[60, 40]), None);
    }

    #[test]
    fn test_normalize_full_width_digits() {
        assert_eq!(normalize_digits("［４］ ７８．５"), "［4］ 78.5");
    }

    #[test]
    fn test_parse_tolerates_decoration() {
        let parser = RubricParser::new(DEMO);
        let fields = parser.parse("**アルファ**（60％）：［４］\n| ベータ | 2 |\n判定：条件付き採用\n合計：64.0点");
        assert_eq!(fields.scores, vec![Some(4), Some(2)]);
        assert_eq!(fields.verdict, Some("条件付き採用"));
        assert_eq!(fields.total, Some(64.0));
        assert!(fields.errors.is_empty(), "{:?}", fields.errors);
    }

    #[test]
    fn test_parse_out_of_range_is_absent() {
        let parser = RubricParser::new(DEMO);
        let fields = parser.parse("アルファ：7\nベータ：0\n判定：採用\n合計：140");
        assert_eq!(fields.scores, vec![None, None]);
        assert_eq!(fields.total, None);
        assert_eq!(fields.errors.len(), 3);
    }

    #[test]
    fn test_total_skips_parenthesised_scale() {
        let parser = RubricParser::new(DEMO);
        let fields = parser.parse("合計（100点満点）：78.0");
        assert_eq!(fields.total, Some(78.0));

        let fields = parser.parse("**合計** (out of 100): 64.5 points");
        assert_eq!(fields.total, Some(64.5));

        let fields = parser.parse("合計（１００点満点）：８２");
        assert_eq!(fields.total, Some(82.0));
    }

    #[test]
    fn test_verdict_earliest_match_wins() {
        let parser = RubricParser::new(DEMO);
        let fields = parser.parse("判定：不採用（採用は時期尚早）");
        assert_eq!(fields.verdict, Some("不採用"));
    }

    #[test]
    fn test_parse_outcome_success_flag() {
        assert!(ParseOutcome::new((), vec![]).success);
        assert!(!ParseOutcome::new((), vec!["x".into()]).success);
    }

    #[test]
    fn test_score_check() {
        assert!(ScoreCheck::new(Some(78.0), Some(78.4)).is_consistent());
        assert!(ScoreCheck::new(None, Some(50.0)).is_consistent());
        let check = ScoreCheck::new(Some(90.0), Some(78.0));
        assert!(!check.is_consistent());
        assert!(check.warning("business").unwrap().contains("90.0"));
    }

    #[test]
    fn test_format_instructions_lists_axes() {
        let text = DEMO.format_instructions();
        assert!(text.contains("アルファ（60％）"));
        assert!(text.contains("採用 / 条件付き採用 / 不採用"));
    }
}
