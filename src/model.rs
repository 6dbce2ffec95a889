//! Record types shared by the store and the aggregation code, plus the
//! parsing that turns loosely-typed request params into checked values.
//!
//! Absent numeric fields are resolved here, once. Nothing downstream of this
//! module coerces missing values.

use crate::ipc::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const SURPRISE_TEST_EXAM_TYPES: [&str; 3] =
    ["SURPRISE TEST-1", "SURPRISE TEST-2", "SURPRISE TEST-3"];
pub const ASSIGNMENT_EXAM_TYPES: [&str; 3] = ["ASSIGNMENT-1", "ASSIGNMENT-2", "ASSIGNMENT-3"];

/// Exam types shown on the parent-teacher meeting sheet.
pub const PTM_EXAM_TYPES: [&str; 3] = ["CIE-1", "SURPRISE TEST-1", "ASSIGNMENT-1"];

/// Exam types checked before the semester-end exam.
pub const SEE_VERIFICATION_EXAM_TYPES: [&str; 8] = [
    "ASSIGNMENT-1",
    "ASSIGNMENT-2",
    "ASSIGNMENT-3",
    "SURPRISE TEST-1",
    "SURPRISE TEST-2",
    "SURPRISE TEST-3",
    "CIE-1",
    "CIE-2",
];

pub fn best_of_two_exam_types() -> Vec<&'static str> {
    SURPRISE_TEST_EXAM_TYPES
        .iter()
        .chain(ASSIGNMENT_EXAM_TYPES.iter())
        .copied()
        .collect()
}

/// Upper bound of a single CO-PO correlation strength.
pub const MAX_CORRELATION: f64 = 3.0;

/// Channel names in storage and wire order.
pub const CHANNELS: [&str; 14] = [
    "po1", "po2", "po3", "po4", "po5", "po6", "po7", "po8", "po9", "po10", "po11", "po12", "pso1",
    "pso2",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InternalExamType {
    #[serde(rename = "CIE-1")]
    Cie1,
    #[serde(rename = "CIE-2")]
    Cie2,
}

impl InternalExamType {
    pub fn as_str(self) -> &'static str {
        match self {
            InternalExamType::Cie1 => "CIE-1",
            InternalExamType::Cie2 => "CIE-2",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "CIE-1" => Ok(InternalExamType::Cie1),
            "CIE-2" => Ok(InternalExamType::Cie2),
            other => Err(AppError::BadParams(format!(
                "examType must be CIE-1 or CIE-2, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttainmentExamType {
    #[serde(rename = "CIE-1")]
    Cie1,
    #[serde(rename = "CIE-2")]
    Cie2,
    #[serde(rename = "SEE")]
    See,
    #[serde(rename = "COMPUTED")]
    Computed,
}

impl AttainmentExamType {
    pub fn as_str(self) -> &'static str {
        match self {
            AttainmentExamType::Cie1 => "CIE-1",
            AttainmentExamType::Cie2 => "CIE-2",
            AttainmentExamType::See => "SEE",
            AttainmentExamType::Computed => "COMPUTED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "CIE-1" => Ok(AttainmentExamType::Cie1),
            "CIE-2" => Ok(AttainmentExamType::Cie2),
            "SEE" => Ok(AttainmentExamType::See),
            "COMPUTED" => Ok(AttainmentExamType::Computed),
            other => Err(AppError::BadParams(format!(
                "examType must be one of CIE-1, CIE-2, SEE, COMPUTED, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttainmentType {
    Direct,
    Indirect,
    ComputedDirect,
    ComputedIndirect,
}

impl AttainmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            AttainmentType::Direct => "direct",
            AttainmentType::Indirect => "indirect",
            AttainmentType::ComputedDirect => "computedDirect",
            AttainmentType::ComputedIndirect => "computedIndirect",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "direct" => Ok(AttainmentType::Direct),
            "indirect" => Ok(AttainmentType::Indirect),
            "computedDirect" => Ok(AttainmentType::ComputedDirect),
            "computedIndirect" => Ok(AttainmentType::ComputedIndirect),
            other => Err(AppError::BadParams(format!(
                "attainmentType must be one of direct, indirect, computedDirect, computedIndirect, got {}",
                other
            ))),
        }
    }
}

/// Half-month attendance bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "15th")]
    Fifteenth,
    #[serde(rename = "30th")]
    Thirtieth,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Fifteenth => "15th",
            Period::Thirtieth => "30th",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "15th" => Ok(Period::Fifteenth),
            "30th" => Ok(Period::Thirtieth),
            other => Err(AppError::BadParams(format!(
                "period must be 15th or 30th, got {}",
                other
            ))),
        }
    }
}

/// The fourteen PO/PSO correlation channels of one CO-PO row, or their
/// averages across a subject.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoChannels(pub [f64; 14]);

impl PoChannels {
    /// Reads `po1..po12, pso1, pso2` from `params`. Missing or null channels
    /// are 0; anything else must be a number within `0..=3`.
    pub fn from_params(params: &Value) -> Result<Self, AppError> {
        let mut values = [0.0; 14];
        for (slot, name) in values.iter_mut().zip(CHANNELS) {
            if let Some(v) = read_channel(params, name)? {
                *slot = v;
            }
        }
        Ok(PoChannels(values))
    }

    /// Overwrites only the channels present in `params`.
    pub fn apply_patch(&mut self, params: &Value) -> Result<bool, AppError> {
        let mut touched = false;
        for (slot, name) in self.0.iter_mut().zip(CHANNELS) {
            if let Some(v) = read_channel(params, name)? {
                *slot = v;
                touched = true;
            }
        }
        Ok(touched)
    }

    /// Renders channels as `{"po1<suffix>": .., ...}`.
    pub fn to_json(&self, suffix: &str) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, v) in CHANNELS.iter().zip(self.0.iter()) {
            out.insert(format!("{}{}", name, suffix), json!(v));
        }
        out
    }
}

fn read_channel(params: &Value, name: &str) -> Result<Option<f64>, AppError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_f64()
                .ok_or_else(|| AppError::BadParams(format!("{} must be a number", name)))?;
            if !(0.0..=MAX_CORRELATION).contains(&n) {
                return Err(AppError::BadParams(format!(
                    "{} must be between 0 and {}",
                    name, MAX_CORRELATION
                )));
            }
            Ok(Some(n))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreePartQuestion {
    #[serde(default)]
    pub a: f64,
    #[serde(default)]
    pub b: f64,
    #[serde(default)]
    pub c: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TwoPartQuestion {
    #[serde(default)]
    pub a: f64,
    #[serde(default)]
    pub b: f64,
}

/// Sub-part scores of one CIE paper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalMarkSheet {
    #[serde(rename = "Q1", default)]
    pub q1: ThreePartQuestion,
    #[serde(rename = "Q2", default)]
    pub q2: TwoPartQuestion,
    #[serde(rename = "Q3", default)]
    pub q3: TwoPartQuestion,
    #[serde(rename = "Q4", default)]
    pub q4: TwoPartQuestion,
}

impl InternalMarkSheet {
    pub fn from_params(raw: Option<&Value>) -> Result<Self, AppError> {
        let Some(raw) = raw.filter(|v| !v.is_null()) else {
            return Ok(Self::default());
        };
        let sheet: InternalMarkSheet = serde_json::from_value(raw.clone())
            .map_err(|e| AppError::BadParams(format!("invalid marks: {}", e)))?;
        if sheet.parts().iter().any(|p| *p < 0.0) {
            return Err(AppError::BadParams(
                "marks must not contain negative parts".to_string(),
            ));
        }
        Ok(sheet)
    }

    /// Parts in column order: q1a q1b q1c q2a q2b q3a q3b q4a q4b.
    pub fn parts(&self) -> [f64; 9] {
        [
            self.q1.a, self.q1.b, self.q1.c, self.q2.a, self.q2.b, self.q3.a, self.q3.b,
            self.q4.a, self.q4.b,
        ]
    }

    pub fn from_parts(p: [f64; 9]) -> Self {
        InternalMarkSheet {
            q1: ThreePartQuestion {
                a: p[0],
                b: p[1],
                c: p[2],
            },
            q2: TwoPartQuestion { a: p[3], b: p[4] },
            q3: TwoPartQuestion { a: p[5], b: p[6] },
            q4: TwoPartQuestion { a: p[7], b: p[8] },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttainmentLevel {
    pub co_no: String,
    #[serde(default)]
    pub attainment_level: Option<f64>,
}

pub fn parse_attainment_data(raw: Option<&Value>) -> Result<Vec<AttainmentLevel>, AppError> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let levels: Vec<AttainmentLevel> = serde_json::from_value(raw.clone())
        .map_err(|e| AppError::BadParams(format!("invalid attainmentData: {}", e)))?;
    if levels.iter().any(|l| l.co_no.trim().is_empty()) {
        return Err(AppError::BadParams(
            "attainmentData entries need a coNo".to_string(),
        ));
    }
    Ok(levels)
}

pub const FEEDBACK_CHANNELS: [&str; 5] = ["CO1", "CO2", "CO3", "CO4", "CO5"];

/// Reads one feedback channel; only 1, 2 and 3 are accepted.
pub fn parse_feedback_level(params: &Value, key: &str) -> Result<Option<i64>, AppError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n @ 1..=3) => Ok(Some(n)),
            _ => Err(AppError::BadParams(format!("{} must be 1, 2 or 3", key))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn po_channels_default_absent_and_null_to_zero() {
        let ch = PoChannels::from_params(&json!({ "po1": 2, "po3": null, "pso2": 1.5 }))
            .expect("parse");
        assert_eq!(ch.0[0], 2.0);
        assert_eq!(ch.0[2], 0.0);
        assert_eq!(ch.0[13], 1.5);
        assert_eq!(ch.0.iter().filter(|v| **v == 0.0).count(), 12);
    }

    #[test]
    fn po_channels_reject_out_of_range_and_strings() {
        assert!(PoChannels::from_params(&json!({ "po4": 4 })).is_err());
        assert!(PoChannels::from_params(&json!({ "po4": -1 })).is_err());
        assert!(PoChannels::from_params(&json!({ "po4": "2" })).is_err());
    }

    #[test]
    fn po_channels_patch_touches_only_given_channels() {
        let mut ch = PoChannels([1.0; 14]);
        let touched = ch.apply_patch(&json!({ "po2": 3 })).expect("patch");
        assert!(touched);
        assert_eq!(ch.0[1], 3.0);
        assert_eq!(ch.0[0], 1.0);
        assert!(!ch.apply_patch(&json!({ "course": "x" })).expect("patch"));
    }

    #[test]
    fn po_channels_json_uses_suffix() {
        let ch = PoChannels([0.0; 14]);
        let m = ch.to_json("_avg");
        assert!(m.contains_key("po12_avg"));
        assert!(m.contains_key("pso1_avg"));
        assert_eq!(m.len(), 14);
    }

    #[test]
    fn mark_sheet_parts_default_and_reject_negatives() {
        let sheet = InternalMarkSheet::from_params(Some(&json!({ "Q1": { "a": 2 }, "Q4": { "b": 5 } })))
            .expect("sheet");
        assert_eq!(sheet.parts(), [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0]);
        assert!(InternalMarkSheet::from_params(Some(&json!({ "Q2": { "a": -1 } }))).is_err());
        assert_eq!(
            InternalMarkSheet::from_params(None).expect("empty"),
            InternalMarkSheet::default()
        );
    }

    #[test]
    fn feedback_levels_are_one_to_three() {
        let p = json!({ "CO1": 1, "CO2": 3, "CO3": 0, "CO4": "2" });
        assert_eq!(parse_feedback_level(&p, "CO1").expect("co1"), Some(1));
        assert_eq!(parse_feedback_level(&p, "CO2").expect("co2"), Some(3));
        assert!(parse_feedback_level(&p, "CO3").is_err());
        assert!(parse_feedback_level(&p, "CO4").is_err());
        assert_eq!(parse_feedback_level(&p, "CO5").expect("co5"), None);
    }
}
