use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

/// A fetched contracting opportunity.
///
/// Identity is `id`; every dedup and carryover decision keys off it. Field aliases accept the
/// SAM.gov search payload directly (`noticeId`, `fullParentPathName`, `responseDeadLine`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Opportunity {
    #[serde(alias = "noticeId")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, alias = "fullParentPathName", deserialize_with = "null_as_empty")]
    pub agency: String,
    #[serde(default, alias = "type", deserialize_with = "null_as_empty")]
    pub notice_type: String,
    #[serde(default, alias = "naicsCode")]
    pub naics_code: Option<String>,
    #[serde(default, alias = "classificationCode")]
    pub classification_code: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(default, alias = "postedDate")]
    pub posted_date: Option<String>,
    #[serde(default, alias = "responseDeadLine")]
    pub response_deadline: Option<String>,
    #[serde(default, alias = "uiLink")]
    pub link: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Opportunity {
    pub fn short_title(&self, max_chars: usize) -> String {
        self.title.chars().take(max_chars).collect()
    }
}

/// An opportunity paired with the result of one scoring tier. Fetched content is never
/// modified; results are attached alongside it.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluated<R> {
    pub opportunity: Opportunity,
    pub result: R,
}

pub type Screened = Evaluated<ScreenResult>;
pub type Assessed = Evaluated<AssessmentResult>;

/// Mini-tier result. Failed evaluations carry `error = true` and `score = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScreenResult {
    pub opportunity_id: String,
    pub score: u8,
    pub reason: String,
    pub model: String,
    pub error: bool,
}

impl ScreenResult {
    pub fn failed(opportunity_id: &str, model: &str, reason: impl Into<String>) -> Self {
        Self {
            opportunity_id: opportunity_id.to_string(),
            score: 0,
            reason: reason.into(),
            model: model.to_string(),
            error: true,
        }
    }
}

/// Deep-tier result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssessmentResult {
    pub opportunity_id: String,
    pub qualified: bool,
    pub score: u8,
    pub justification: String,
    #[serde(default)]
    pub key_requirements: Vec<String>,
    #[serde(default)]
    pub company_advantages: Vec<String>,
    #[serde(default)]
    pub suggested_approach: String,
    #[serde(default)]
    pub ai_application: String,
    #[serde(default)]
    pub similar_past_rfps: Vec<String>,
    #[serde(default)]
    pub uncertainty_factors: Vec<String>,
    pub model: String,
    /// Produced by the fallback backend or by heuristic extraction.
    #[serde(default)]
    pub degraded: bool,
    pub error: bool,
}

impl AssessmentResult {
    pub fn failed(opportunity_id: &str, model: &str, reason: impl Into<String>) -> Self {
        Self {
            opportunity_id: opportunity_id.to_string(),
            qualified: false,
            score: 0,
            justification: reason.into(),
            key_requirements: Vec::new(),
            company_advantages: Vec::new(),
            suggested_approach: String::new(),
            ai_application: String::new(),
            similar_past_rfps: Vec::new(),
            uncertainty_factors: Vec::new(),
            model: model.to_string(),
            degraded: false,
            error: true,
        }
    }
}

/// Final bucket for one evaluated opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    RejectedByMini,
    Qualified,
    Maybe,
    Rejected,
    /// Passed the mini tier but the run ended before deep analysis; the item is carried over.
    Deferred,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::RejectedByMini => "rejected_by_mini",
            Tier::Qualified => "qualified",
            Tier::Maybe => "maybe",
            Tier::Rejected => "rejected",
            Tier::Deferred => "deferred",
        }
    }
}

/// Score cutoffs, loaded from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Minimum mini score to reach the deep tier.
    pub screen: u8,
    /// Minimum deep score for the maybe bucket.
    pub maybe: u8,
    /// Minimum deep score to qualify; also the mini "high priority" cutoff.
    pub qualified: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            screen: 4,
            maybe: 4,
            qualified: 7,
        }
    }
}

impl Thresholds {
    pub fn is_qualified(&self, score: u8, error: bool) -> bool {
        !error && score >= self.qualified
    }

    /// Deep-tier bucket. Errors never leave the rejected bucket.
    pub fn deep_tier(&self, result: &AssessmentResult) -> Tier {
        if result.error {
            Tier::Rejected
        } else if result.score >= self.qualified {
            Tier::Qualified
        } else if result.score >= self.maybe {
            Tier::Maybe
        } else {
            Tier::Rejected
        }
    }
}

/// What a sink receives for one opportunity: whichever tier produced its latest score.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Screen(ScreenResult),
    Assessment(AssessmentResult),
}

impl Outcome {
    pub fn score(&self) -> u8 {
        match self {
            Outcome::Screen(r) => r.score,
            Outcome::Assessment(r) => r.score,
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            Outcome::Screen(r) => r.error,
            Outcome::Assessment(r) => r.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_sam_payload_with_nulls() {
        let raw = r#"{
            "noticeId": "abc123",
            "title": "Data platform modernization",
            "fullParentPathName": "DEPT OF DEFENSE.ARMY",
            "type": "Solicitation",
            "naicsCode": "541512",
            "classificationCode": null,
            "description": null,
            "postedDate": "2025-08-13",
            "responseDeadLine": "2025-09-01T17:00:00-04:00",
            "uiLink": "https://sam.gov/opp/abc123/view"
        }"#;
        let opp: Opportunity = serde_json::from_str(raw).unwrap();
        assert_eq!(opp.id, "abc123");
        assert_eq!(opp.agency, "DEPT OF DEFENSE.ARMY");
        assert_eq!(opp.notice_type, "Solicitation");
        assert_eq!(opp.classification_code, None);
        assert_eq!(opp.description, "");
        assert_eq!(opp.link.as_deref(), Some("https://sam.gov/opp/abc123/view"));
    }

    #[test]
    fn deep_tier_boundaries() {
        let t = Thresholds::default();
        let mut result = AssessmentResult::failed("x", "gpt-5", "n/a");
        result.error = false;

        for (score, tier) in [
            (10, Tier::Qualified),
            (7, Tier::Qualified),
            (6, Tier::Maybe),
            (4, Tier::Maybe),
            (3, Tier::Rejected),
            (1, Tier::Rejected),
        ] {
            result.score = score;
            assert_eq!(t.deep_tier(&result), tier, "score {score}");
        }
    }

    #[test]
    fn errors_are_never_promoted() {
        let t = Thresholds::default();
        let mut result = AssessmentResult::failed("x", "gpt-5", "timeout");
        result.score = 9;
        assert_eq!(t.deep_tier(&result), Tier::Rejected);
        assert!(!t.is_qualified(result.score, result.error));
    }

    #[test]
    fn short_title_respects_char_boundaries() {
        let opp = Opportunity {
            id: "1".into(),
            title: "Café systems".into(),
            agency: String::new(),
            notice_type: String::new(),
            naics_code: None,
            classification_code: None,
            description: String::new(),
            posted_date: None,
            response_deadline: None,
            link: None,
        };
        assert_eq!(opp.short_title(4), "Café");
    }
}
