use crate::model::{AttainmentLevel, InternalMarkSheet, Period, PoChannels};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

const SURPRISE_TEST_TAG: &str = "SURPRISE TEST";

/// Best-of-two always divides by two; a missing second attempt counts as 0.
const BEST_OF_TWO_DIVISOR: f64 = 2.0;

/// Grading-policy rounding for best-of-two scores:
/// `x >= 9.5` is credited as 10, everything else is floored.
pub fn custom_round(x: f64) -> f64 {
    if x >= 9.5 {
        10.0
    } else {
        x.floor()
    }
}

/// Standard rounding to 2 decimal places (half away from zero).
pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub student_id: String,
    pub roll_no: String,
    pub name: String,
}

/// One surprise-test or assignment score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMark {
    pub student: StudentRef,
    pub exam_type: String,
    pub marks: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BestOfTwoRow {
    #[serde(flatten)]
    pub student: StudentRef,
    pub surprise_test_average: f64,
    pub assignment_average: f64,
}

fn is_surprise_test(exam_type: &str) -> bool {
    exam_type.contains(SURPRISE_TEST_TAG)
}

fn best_two_mean(mut scores: Vec<f64>) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let top: f64 = scores.iter().take(2).sum();
    top / BEST_OF_TWO_DIVISOR
}

/// Per-student best-of-two averages for surprise tests and assignments.
///
/// Students appear in the order of their first mark in `marks`. Any exam type
/// not tagged as a surprise test is treated as an assignment, so callers must
/// pre-filter to the six recognised types.
pub fn best_of_two(marks: &[ScoredMark]) -> Vec<BestOfTwoRow> {
    let mut order: Vec<StudentRef> = Vec::new();
    let mut buckets: HashMap<String, (Vec<f64>, Vec<f64>)> = HashMap::new();

    for m in marks {
        let entry = buckets
            .entry(m.student.student_id.clone())
            .or_insert_with(|| {
                order.push(m.student.clone());
                (Vec::new(), Vec::new())
            });
        if is_surprise_test(&m.exam_type) {
            entry.0.push(m.marks);
        } else {
            entry.1.push(m.marks);
        }
    }

    order
        .into_iter()
        .map(|student| {
            let (tests, assignments) = buckets.remove(&student.student_id).unwrap_or_default();
            BestOfTwoRow {
                student,
                surprise_test_average: custom_round(best_two_mean(tests)),
                assignment_average: custom_round(best_two_mean(assignments)),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuestionTotals {
    #[serde(rename = "Q1")]
    pub q1: f64,
    #[serde(rename = "Q2")]
    pub q2: f64,
    #[serde(rename = "Q3")]
    pub q3: f64,
    #[serde(rename = "Q4")]
    pub q4: f64,
}

pub fn question_totals(sheet: &InternalMarkSheet) -> QuestionTotals {
    QuestionTotals {
        q1: sheet.q1.a + sheet.q1.b + sheet.q1.c,
        q2: sheet.q2.a + sheet.q2.b,
        q3: sheet.q3.a + sheet.q3.b,
        q4: sheet.q4.a + sheet.q4.b,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionTotalsRow {
    #[serde(flatten)]
    pub student: StudentRef,
    pub internal_marks: QuestionTotals,
}

pub fn question_totals_rows(sheets: &[(StudentRef, InternalMarkSheet)]) -> Vec<QuestionTotalsRow> {
    sheets
        .iter()
        .map(|(student, sheet)| QuestionTotalsRow {
            student: student.clone(),
            internal_marks: question_totals(sheet),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttainmentViewRow {
    #[serde(flatten)]
    pub student: StudentRef,
    pub surprise_test_average: f64,
    pub assignment_average: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_marks: Option<QuestionTotals>,
}

/// Merges best-of-two averages with CIE question totals, one row per student.
///
/// Rows keep the best-of-two order; students that only have internal marks
/// are appended in their own order with both averages at 0.
pub fn attainment_view(
    best: Vec<BestOfTwoRow>,
    totals: Vec<QuestionTotalsRow>,
) -> Vec<AttainmentViewRow> {
    let mut rows: Vec<AttainmentViewRow> = Vec::with_capacity(best.len() + totals.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for b in best {
        index.insert(b.student.student_id.clone(), rows.len());
        rows.push(AttainmentViewRow {
            student: b.student,
            surprise_test_average: b.surprise_test_average,
            assignment_average: b.assignment_average,
            internal_marks: None,
        });
    }

    for t in totals {
        match index.get(&t.student.student_id) {
            Some(&i) => rows[i].internal_marks = Some(t.internal_marks),
            None => {
                index.insert(t.student.student_id.clone(), rows.len());
                rows.push(AttainmentViewRow {
                    student: t.student,
                    surprise_test_average: 0.0,
                    assignment_average: 0.0,
                    internal_marks: Some(t.internal_marks),
                });
            }
        }
    }

    rows
}

/// Column averages of a subject's CO-PO rows. `None` when there are no rows.
pub fn copo_average(entries: &[PoChannels]) -> Option<PoChannels> {
    if entries.is_empty() {
        return None;
    }
    let mut sums = [0.0; 14];
    for e in entries {
        for (s, v) in sums.iter_mut().zip(e.0.iter()) {
            *s += v;
        }
    }
    let n = entries.len() as f64;
    Some(PoChannels(sums.map(|s| round_2_decimals(s / n))))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelUpdate {
    pub co_no: String,
    #[serde(default)]
    pub attainment_level: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelUpdateOutcome {
    pub updated: usize,
    pub skipped: Vec<String>,
}

/// Applies `updates` to the matching `coNo` entries in place.
///
/// Unknown labels are collected in `skipped`; the caller decides whether a
/// batch with `updated == 0` is persisted (it must not be).
pub fn apply_level_updates(
    levels: &mut [AttainmentLevel],
    updates: &[LevelUpdate],
) -> LevelUpdateOutcome {
    let mut outcome = LevelUpdateOutcome::default();
    for u in updates {
        match levels.iter_mut().find(|l| l.co_no == u.co_no) {
            Some(level) => {
                level.attainment_level = u.attainment_level;
                outcome.updated += 1;
            }
            None => outcome.skipped.push(u.co_no.clone()),
        }
    }
    outcome
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AttendancePeriod {
    pub period: Period,
    pub month: u32,
    pub year: i32,
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(30)
}

/// Attendance periods touched by `start..=end`, in calendar order.
///
/// Every month in range has a 15th period. The 30th period exists for months
/// of at least 30 days and is included unless the range ends on or before
/// the 15th of that month.
pub fn attendance_periods(start: NaiveDate, end: NaiveDate) -> Vec<AttendancePeriod> {
    let mut out = Vec::new();
    if start > end {
        return out;
    }
    let (mut year, mut month) = (start.year(), start.month());
    loop {
        out.push(AttendancePeriod {
            period: Period::Fifteenth,
            month,
            year,
        });
        let is_end_month = year == end.year() && month == end.month();
        if days_in_month(year, month) >= 30 && (!is_end_month || end.day() > 15) {
            out.push(AttendancePeriod {
                period: Period::Thirtieth,
                month,
                year,
            });
        }
        if is_end_month {
            break;
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ThreePartQuestion, TwoPartQuestion};
    use proptest::prelude::*;

    fn student(id: &str) -> StudentRef {
        StudentRef {
            student_id: id.to_string(),
            roll_no: format!("R-{}", id),
            name: format!("Student {}", id),
        }
    }

    fn mark(id: &str, exam_type: &str, marks: f64) -> ScoredMark {
        ScoredMark {
            student: student(id),
            exam_type: exam_type.to_string(),
            marks,
        }
    }

    #[test]
    fn custom_round_credits_only_near_max() {
        assert_eq!(custom_round(9.5), 10.0);
        assert_eq!(custom_round(9.49), 9.0);
        assert_eq!(custom_round(10.0), 10.0);
        assert_eq!(custom_round(0.0), 0.0);
        assert_eq!(custom_round(7.99), 7.0);
    }

    #[test]
    fn round_2_decimals_is_standard() {
        assert_eq!(round_2_decimals(2.5), 2.5);
        assert_eq!(round_2_decimals(1.666_666), 1.67);
        assert_eq!(round_2_decimals(2.0 / 3.0), 0.67);
        assert_eq!(round_2_decimals(1.125), 1.13);
    }

    #[test]
    fn best_of_two_keeps_top_two_per_bucket() {
        let marks = vec![
            mark("a", "SURPRISE TEST-1", 6.0),
            mark("a", "SURPRISE TEST-2", 9.0),
            mark("a", "SURPRISE TEST-3", 10.0),
            mark("a", "ASSIGNMENT-1", 8.0),
            mark("a", "ASSIGNMENT-2", 7.0),
            mark("a", "ASSIGNMENT-3", 3.0),
        ];
        let rows = best_of_two(&marks);
        assert_eq!(rows.len(), 1);
        // (10 + 9) / 2 = 9.5 -> 10; (8 + 7) / 2 = 7.5 -> 7
        assert_eq!(rows[0].surprise_test_average, 10.0);
        assert_eq!(rows[0].assignment_average, 7.0);
    }

    #[test]
    fn best_of_two_empty_bucket_is_zero_and_single_entry_is_halved() {
        let marks = vec![mark("b", "ASSIGNMENT-2", 8.0)];
        let rows = best_of_two(&marks);
        assert_eq!(rows[0].surprise_test_average, 0.0);
        assert_eq!(rows[0].assignment_average, 4.0);
    }

    #[test]
    fn best_of_two_preserves_first_appearance_order() {
        let marks = vec![
            mark("z", "ASSIGNMENT-1", 5.0),
            mark("a", "ASSIGNMENT-1", 5.0),
            mark("z", "SURPRISE TEST-1", 5.0),
        ];
        let ids: Vec<String> = best_of_two(&marks)
            .into_iter()
            .map(|r| r.student.student_id)
            .collect();
        assert_eq!(ids, vec!["z".to_string(), "a".to_string()]);
    }

    const EXAM_TYPES: [&str; 6] = [
        "SURPRISE TEST-1",
        "SURPRISE TEST-2",
        "SURPRISE TEST-3",
        "ASSIGNMENT-1",
        "ASSIGNMENT-2",
        "ASSIGNMENT-3",
    ];

    proptest! {
        #[test]
        fn best_of_two_stays_within_zero_and_ten(
            picks in prop::collection::vec((0usize..4, 0usize..6, 0.0f64..=10.0), 0..40)
        ) {
            let marks: Vec<ScoredMark> = picks
                .iter()
                .map(|(s, e, v)| mark(&s.to_string(), EXAM_TYPES[*e], *v))
                .collect();
            for row in best_of_two(&marks) {
                prop_assert!((0.0..=10.0).contains(&row.surprise_test_average));
                prop_assert!((0.0..=10.0).contains(&row.assignment_average));
                let id = &row.student.student_id;
                let has_tests = marks
                    .iter()
                    .any(|m| &m.student.student_id == id && m.exam_type.contains("SURPRISE"));
                if !has_tests {
                    prop_assert_eq!(row.surprise_test_average, 0.0);
                }
            }
        }
    }

    #[test]
    fn question_totals_sum_parts_without_rounding() {
        let sheet = InternalMarkSheet {
            q1: ThreePartQuestion {
                a: 1.5,
                b: 2.0,
                c: 0.25,
            },
            q2: TwoPartQuestion { a: 3.0, b: 4.0 },
            q3: TwoPartQuestion { a: 0.0, b: 0.5 },
            q4: TwoPartQuestion { a: 5.0, b: 5.0 },
        };
        let t = question_totals(&sheet);
        assert_eq!(t.q1, 3.75);
        assert_eq!(t.q2, 7.0);
        assert_eq!(t.q3, 0.5);
        assert_eq!(t.q4, 10.0);
    }

    #[test]
    fn attainment_view_appends_internal_only_students_with_zero_averages() {
        let best = best_of_two(&[
            mark("a", "ASSIGNMENT-1", 10.0),
            mark("a", "ASSIGNMENT-2", 10.0),
            mark("b", "SURPRISE TEST-1", 6.0),
            mark("b", "SURPRISE TEST-2", 6.0),
        ]);
        let sheet = InternalMarkSheet {
            q1: ThreePartQuestion {
                a: 1.0,
                b: 1.0,
                c: 1.0,
            },
            ..Default::default()
        };
        let totals = question_totals_rows(&[(student("c"), sheet), (student("a"), sheet)]);
        let view = attainment_view(best, totals);

        let ids: Vec<&str> = view.iter().map(|r| r.student.student_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(view[0].assignment_average, 10.0);
        assert_eq!(view[0].internal_marks.map(|t| t.q1), Some(3.0));
        assert_eq!(view[1].surprise_test_average, 6.0);
        assert!(view[1].internal_marks.is_none());
        assert_eq!(view[2].surprise_test_average, 0.0);
        assert_eq!(view[2].assignment_average, 0.0);
        assert_eq!(view[2].internal_marks.map(|t| t.q1), Some(3.0));
    }

    #[test]
    fn attainment_view_of_nothing_is_empty() {
        assert!(attainment_view(Vec::new(), Vec::new()).is_empty());
    }

    #[test]
    fn attainment_view_serializes_flat_rows() {
        let view = attainment_view(best_of_two(&[mark("a", "ASSIGNMENT-1", 4.0)]), Vec::new());
        let v = serde_json::to_value(&view[0]).expect("json");
        assert_eq!(v["studentId"], "a");
        assert_eq!(v["rollNo"], "R-a");
        assert!(v.get("internalMarks").is_none());
    }

    fn po1(v: f64) -> PoChannels {
        let mut c = [0.0; 14];
        c[0] = v;
        PoChannels(c)
    }

    #[test]
    fn copo_average_recomputes_from_scratch() {
        let mut entries = vec![po1(2.0), po1(3.0)];
        assert_eq!(copo_average(&entries).map(|a| a.0[0]), Some(2.5));
        entries.push(po1(1.0));
        assert_eq!(copo_average(&entries).map(|a| a.0[0]), Some(2.0));
    }

    #[test]
    fn copo_average_rounds_each_channel_and_rejects_empty() {
        let entries = vec![po1(1.0), po1(1.0), po1(0.0)];
        let avg = copo_average(&entries).expect("avg");
        assert_eq!(avg.0[0], 0.67);
        assert_eq!(avg.0[13], 0.0);
        assert!(copo_average(&[]).is_none());
    }

    fn levels() -> Vec<AttainmentLevel> {
        vec![
            AttainmentLevel {
                co_no: "CO1".into(),
                attainment_level: Some(2.0),
            },
            AttainmentLevel {
                co_no: "CO2".into(),
                attainment_level: Some(3.0),
            },
        ]
    }

    #[test]
    fn level_updates_count_matches_and_skip_unknown_labels() {
        let mut data = levels();
        let outcome = apply_level_updates(
            &mut data,
            &[
                LevelUpdate {
                    co_no: "CO1".into(),
                    attainment_level: Some(1.0),
                },
                LevelUpdate {
                    co_no: "CO9".into(),
                    attainment_level: Some(3.0),
                },
            ],
        );
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.skipped, vec!["CO9".to_string()]);
        assert_eq!(data[0].attainment_level, Some(1.0));
        assert_eq!(data[1].attainment_level, Some(3.0));
    }

    #[test]
    fn level_updates_with_no_match_leave_data_untouched() {
        let mut data = levels();
        let outcome = apply_level_updates(
            &mut data,
            &[LevelUpdate {
                co_no: "CO9".into(),
                attainment_level: Some(1.0),
            }],
        );
        assert_eq!(outcome.updated, 0);
        assert_eq!(data, levels());
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[test]
    fn attendance_periods_span_months() {
        let got = attendance_periods(ymd(2024, 1, 20), ymd(2024, 3, 10));
        let want = vec![
            AttendancePeriod {
                period: Period::Fifteenth,
                month: 1,
                year: 2024,
            },
            AttendancePeriod {
                period: Period::Thirtieth,
                month: 1,
                year: 2024,
            },
            AttendancePeriod {
                period: Period::Fifteenth,
                month: 2,
                year: 2024,
            },
            AttendancePeriod {
                period: Period::Fifteenth,
                month: 3,
                year: 2024,
            },
        ];
        assert_eq!(got, want);
    }

    #[test]
    fn attendance_periods_cross_year_and_include_late_end_month() {
        let got = attendance_periods(ymd(2024, 12, 1), ymd(2025, 1, 20));
        assert_eq!(got.len(), 4);
        assert_eq!(got[3].year, 2025);
        assert_eq!(got[3].period, Period::Thirtieth);
        assert!(attendance_periods(ymd(2024, 5, 2), ymd(2024, 5, 1)).is_empty());
    }
}
