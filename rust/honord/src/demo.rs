use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Grade bands used to fabricate demo students.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTier {
    HighestHonors,
    HighHonors,
    WithHonors,
    Proficient,
    Developing,
}

impl PerformanceTier {
    pub const ALL: [PerformanceTier; 5] = [
        PerformanceTier::HighestHonors,
        PerformanceTier::HighHonors,
        PerformanceTier::WithHonors,
        PerformanceTier::Proficient,
        PerformanceTier::Developing,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::HighestHonors => "highest_honors",
            Self::HighHonors => "high_honors",
            Self::WithHonors => "with_honors",
            Self::Proficient => "proficient",
            Self::Developing => "developing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.key().eq_ignore_ascii_case(s.trim()))
    }

    /// Inclusive integer grade range.
    pub fn range(self) -> (u32, u32) {
        match self {
            Self::HighestHonors => (98, 100),
            Self::HighHonors => (95, 97),
            Self::WithHonors => (90, 94),
            Self::Proficient => (85, 89),
            Self::Developing => (75, 84),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoGrade {
    pub subject_id: String,
    pub period_code: String,
    pub grade: f64,
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// One grade per (subject, period), drawn uniformly from the tier's range.
pub fn generate_grades(
    rng: &mut StdRng,
    tier: PerformanceTier,
    subjects: &[String],
    periods: &[String],
) -> Vec<DemoGrade> {
    let (lo, hi) = tier.range();
    let mut out = Vec::with_capacity(subjects.len() * periods.len());
    for period in periods {
        for subject in subjects {
            out.push(DemoGrade {
                subject_id: subject.clone(),
                period_code: period.clone(),
                grade: f64::from(rng.gen_range(lo..=hi)),
            });
        }
    }
    out
}
