use crate::honor::HonorError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingPeriod {
    pub code: String,
    pub name: String,
    pub parent_code: Option<String>,
    pub sort_order: i64,
    pub weight: f64,
    pub is_calculated: bool,
}

/// Which periods get their own honor decision when a level is evaluated per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HonorGranularity {
    /// Leaf periods that take direct grade entry (quarters).
    EntryPeriods,
    /// Top-level periods of the school year (semesters).
    Terms,
}

/// Parent/child grading periods of one academic level.
///
/// An empty tree is "flat": every period code seen in the grades is an
/// independent, non-calculated root with weight 1.
#[derive(Debug, Clone, Default)]
pub struct PeriodTree {
    periods: HashMap<String, GradingPeriod>,
    children: HashMap<String, Vec<String>>,
    roots: Vec<String>,
}

fn sort_key<'a>(periods: &'a HashMap<String, GradingPeriod>, code: &'a str) -> (i64, &'a str) {
    (periods.get(code).map(|p| p.sort_order).unwrap_or(0), code)
}

pub fn effective_weight(w: f64) -> f64 {
    if w.is_finite() && w > 0.0 {
        w
    } else {
        1.0
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn weighted_mean<I>(pairs: I) -> Option<f64>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for (value, weight) in pairs {
        sum += value * weight;
        denom += weight;
    }
    if denom > 0.0 {
        Some(sum / denom)
    } else {
        None
    }
}

impl PeriodTree {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn new(periods: Vec<GradingPeriod>) -> Result<Self, HonorError> {
        let mut by_code: HashMap<String, GradingPeriod> = HashMap::new();
        for p in periods {
            if by_code.contains_key(&p.code) {
                return Err(HonorError::InvalidPeriodTree(format!(
                    "duplicate period code {}",
                    p.code
                )));
            }
            by_code.insert(p.code.clone(), p);
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut roots: Vec<String> = Vec::new();
        for p in by_code.values() {
            match &p.parent_code {
                None => roots.push(p.code.clone()),
                Some(parent) => {
                    if !by_code.contains_key(parent) {
                        return Err(HonorError::InvalidPeriodTree(format!(
                            "period {} names missing parent {}",
                            p.code, parent
                        )));
                    }
                    children
                        .entry(parent.clone())
                        .or_default()
                        .push(p.code.clone());
                }
            }
        }

        for p in by_code.values() {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut cur = p.parent_code.as_deref();
            while let Some(code) = cur {
                if code == p.code || !seen.insert(code) {
                    return Err(HonorError::InvalidPeriodTree(format!(
                        "period {} is part of a parent cycle",
                        p.code
                    )));
                }
                cur = by_code.get(code).and_then(|x| x.parent_code.as_deref());
            }
        }

        roots.sort_by(|a, b| sort_key(&by_code, a).cmp(&sort_key(&by_code, b)));
        for kids in children.values_mut() {
            kids.sort_by(|a, b| sort_key(&by_code, a).cmp(&sort_key(&by_code, b)));
        }

        Ok(Self {
            periods: by_code,
            children,
            roots,
        })
    }

    pub fn is_flat(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn knows(&self, code: &str) -> bool {
        self.is_flat() || self.periods.contains_key(code)
    }

    pub fn is_calculated(&self, code: &str) -> bool {
        self.periods
            .get(code)
            .map(|p| p.is_calculated)
            .unwrap_or(false)
    }

    fn weight(&self, code: &str) -> f64 {
        self.periods
            .get(code)
            .map(|p| effective_weight(p.weight))
            .unwrap_or(1.0)
    }

    /// True when `code` is `ancestor` or sits anywhere below it.
    pub fn contains(&self, ancestor: &str, code: &str) -> bool {
        let mut cur = Some(code);
        let mut hops = 0usize;
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.periods.len() {
                return false;
            }
            cur = self.periods.get(c).and_then(|p| p.parent_code.as_deref());
        }
        false
    }

    /// Value of one period for one subject. Non-calculated periods use their own
    /// entries when present; otherwise the value is the weighted mean of children.
    pub fn value_of(&self, code: &str, grades: &HashMap<&str, Vec<f64>>) -> Option<f64> {
        if !self.is_calculated(code) {
            if let Some(v) = grades.get(code).and_then(|v| mean(v)) {
                return Some(v);
            }
        }
        let kids = self.children.get(code)?;
        weighted_mean(
            kids.iter()
                .filter_map(|c| self.value_of(c, grades).map(|v| (v, self.weight(c)))),
        )
    }

    /// Whole-year value for one subject: weighted mean over the root periods.
    pub fn yearly_value(&self, grades: &HashMap<&str, Vec<f64>>) -> Option<f64> {
        if self.is_flat() {
            let mut codes: Vec<&str> = grades.keys().copied().collect();
            codes.sort_unstable();
            return weighted_mean(
                codes
                    .into_iter()
                    .filter_map(|c| self.value_of(c, grades).map(|v| (v, 1.0))),
            );
        }
        weighted_mean(
            self.roots
                .iter()
                .filter_map(|c| self.value_of(c, grades).map(|v| (v, self.weight(c)))),
        )
    }

    fn collect_entry_periods(&self, code: &str, out: &mut Vec<String>) {
        match self.children.get(code) {
            Some(kids) if !kids.is_empty() => {
                for k in kids {
                    self.collect_entry_periods(k, out);
                }
            }
            _ => {
                if !self.is_calculated(code) {
                    out.push(code.to_string());
                }
            }
        }
    }

    /// Periods that receive their own honor decision, in school-year order.
    /// `seen` supplies the period codes when the tree is flat.
    pub fn honor_periods(&self, granularity: HonorGranularity, seen: &[&str]) -> Vec<String> {
        if self.is_flat() {
            // No sort order to go by; codes keep the order grades were entered in.
            let mut codes: Vec<String> = Vec::new();
            for code in seen {
                if !codes.iter().any(|c| c == code) {
                    codes.push(code.to_string());
                }
            }
            return codes;
        }
        match granularity {
            HonorGranularity::Terms => self.roots.clone(),
            HonorGranularity::EntryPeriods => {
                let mut out = Vec::new();
                for r in &self.roots {
                    self.collect_entry_periods(r, &mut out);
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period(code: &str, parent: Option<&str>, sort: i64, weight: f64, calc: bool) -> GradingPeriod {
        GradingPeriod {
            code: code.to_string(),
            name: code.to_string(),
            parent_code: parent.map(|s| s.to_string()),
            sort_order: sort,
            weight,
            is_calculated: calc,
        }
    }

    fn college_tree() -> PeriodTree {
        PeriodTree::new(vec![
            period("S2", None, 2, 1.0, true),
            period("S1", None, 1, 1.0, true),
            period("S1_FINAL", Some("S1"), 3, 0.4, false),
            period("S1_MIDTERM", Some("S1"), 1, 0.3, false),
            period("S1_PREFINAL", Some("S1"), 2, 0.3, false),
            period("S2_MIDTERM", Some("S2"), 1, 0.5, false),
            period("S2_FINAL", Some("S2"), 2, 0.5, false),
        ])
        .expect("valid tree")
    }

    #[test]
    fn calculated_parent_is_weighted_mean_of_children() {
        let tree = college_tree();
        let mut grades: HashMap<&str, Vec<f64>> = HashMap::new();
        grades.insert("S1_MIDTERM", vec![90.0]);
        grades.insert("S1_PREFINAL", vec![90.0]);
        grades.insert("S1_FINAL", vec![100.0]);
        let s1 = tree.value_of("S1", &grades).expect("s1 value");
        assert!((s1 - 94.0).abs() < 1e-9);
    }

    #[test]
    fn calculated_parent_ignores_its_own_entries() {
        let tree = college_tree();
        let mut grades: HashMap<&str, Vec<f64>> = HashMap::new();
        grades.insert("S1", vec![60.0]);
        grades.insert("S1_MIDTERM", vec![80.0]);
        assert_eq!(tree.value_of("S1", &grades), Some(80.0));
    }

    #[test]
    fn yearly_value_folds_semesters() {
        let tree = college_tree();
        let mut grades: HashMap<&str, Vec<f64>> = HashMap::new();
        grades.insert("S1_MIDTERM", vec![90.0]);
        grades.insert("S1_PREFINAL", vec![90.0]);
        grades.insert("S1_FINAL", vec![100.0]);
        grades.insert("S2_MIDTERM", vec![88.0]);
        grades.insert("S2_FINAL", vec![92.0]);
        let year = tree.yearly_value(&grades).expect("year value");
        assert!((year - 92.0).abs() < 1e-9);
    }

    #[test]
    fn flat_tree_averages_period_means() {
        let tree = PeriodTree::flat();
        let mut grades: HashMap<&str, Vec<f64>> = HashMap::new();
        grades.insert("Q1", vec![90.0]);
        grades.insert("Q2", vec![94.0]);
        assert_eq!(tree.yearly_value(&grades), Some(92.0));
        assert!(tree.knows("anything"));
    }

    #[test]
    fn entry_periods_follow_sort_order() {
        let tree = college_tree();
        assert_eq!(
            tree.honor_periods(HonorGranularity::EntryPeriods, &[]),
            vec!["S1_MIDTERM", "S1_PREFINAL", "S1_FINAL", "S2_MIDTERM", "S2_FINAL"]
        );
        assert_eq!(
            tree.honor_periods(HonorGranularity::Terms, &[]),
            vec!["S1", "S2"]
        );
        assert!(tree.contains("S1", "S1_FINAL"));
        assert!(!tree.contains("S2", "S1_FINAL"));
    }

    #[test]
    fn flat_tree_keeps_codes_in_entry_order() {
        let tree = PeriodTree::flat();
        let seen = ["FIRST", "SECOND", "FIRST", "THIRD", "FOURTH", "THIRD"];
        assert_eq!(
            tree.honor_periods(HonorGranularity::EntryPeriods, &seen),
            vec!["FIRST", "SECOND", "THIRD", "FOURTH"]
        );
    }

    #[test]
    fn rejects_missing_parent_and_cycles() {
        let missing = PeriodTree::new(vec![period("Q1", Some("S9"), 1, 1.0, false)]);
        assert!(matches!(missing, Err(HonorError::InvalidPeriodTree(_))));

        let cycle = PeriodTree::new(vec![
            period("A", Some("B"), 1, 1.0, false),
            period("B", Some("A"), 2, 1.0, false),
        ]);
        assert!(matches!(cycle, Err(HonorError::InvalidPeriodTree(_))));
    }
}
