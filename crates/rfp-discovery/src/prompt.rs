use crate::backend::Prompt;
use crate::config::CompanyProfile;
use crate::model::Opportunity;

const MINI_DESCRIPTION_CHARS: usize = 1_500;
pub const MINI_OUTPUT_TOKENS: u32 = 2_000;

/// Caller-supplied material the scoring prompts are built around.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub company_name: String,
    pub profile: String,
    pub capabilities: Vec<String>,
    /// Free-text examples of previously won work.
    pub past_wins: Option<String>,
}

impl EvaluationContext {
    pub fn from_profile(profile: &CompanyProfile) -> Self {
        Self {
            company_name: profile.company.name.clone(),
            profile: profile.company.profile.clone(),
            capabilities: profile.company.capabilities.clone(),
            past_wins: (!profile.company.past_performance.is_empty())
                .then(|| profile.company.past_performance.join("\n")),
        }
    }

    fn capability_lines(&self) -> String {
        self.capabilities
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn or_na(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("N/A")
}

fn header(opp: &Opportunity) -> String {
    format!(
        "Notice ID: {}\nTitle: {}\nAgency: {}\nType: {}\nNAICS: {}\nPSC: {}\nResponse deadline: {}",
        opp.id,
        or_na(Some(&opp.title)),
        or_na(Some(&opp.agency)),
        or_na(Some(&opp.notice_type)),
        or_na(opp.naics_code.as_deref()),
        or_na(opp.classification_code.as_deref()),
        or_na(opp.response_deadline.as_deref()),
    )
}

/// Short relevance check. Expects `{"score": 1-10, "reason": "..."}` back.
pub fn mini_prompt(ctx: &EvaluationContext, opp: &Opportunity) -> Prompt {
    let description: String = opp.description.chars().take(MINI_DESCRIPTION_CHARS).collect();
    let user = format!(
        "Quickly rate how relevant this opportunity is for {name}.\n\n\
         {name} capabilities:\n{caps}\n\n\
         {header}\n\nDescription:\n{description}\n\n\
         Score 1-3: clearly irrelevant. 4-6: possibly relevant. 7-10: strong fit.\n\
         Respond with JSON only: {{\"score\": <1-10>, \"reason\": \"<one sentence>\"}}",
        name = ctx.company_name,
        caps = ctx.capability_lines(),
        header = header(opp),
    );
    Prompt {
        system: "You screen government RFPs for relevance. Respond only with valid JSON.".to_string(),
        user,
    }
}

/// Full assessment with structured extras.
pub fn deep_prompt(ctx: &EvaluationContext, opp: &Opportunity) -> Prompt {
    let user = format!(
        "You are evaluating an opportunity for {name}.\n\n\
         COMPANY PROFILE:\n{profile}\n\n\
         PAST WINNING RFPs:\n{past}\n\n\
         OPPORTUNITY:\n{header}\n\nFULL DESCRIPTION:\n{description}\n\n\
         Areas where {name} excels:\n{caps}\n\n\
         Score 1-3: not relevant. 4-6: relevant but uncertain fit. 7-10: strong fit.\n\
         Respond with JSON only:\n\
         {{\"is_qualified\": <true if score >= 7>, \"relevance_score\": <1-10>, \
         \"justification\": \"...\", \"key_requirements\": [...], \"company_advantages\": [...], \
         \"suggested_approach\": \"...\", \"ai_application\": \"...\", \
         \"similar_past_rfps\": [...], \"uncertainty_factors\": [...]}}",
        name = ctx.company_name,
        profile = ctx.profile,
        past = ctx.past_wins.as_deref().unwrap_or("No past RFP examples available"),
        header = header(opp),
        description = or_na(Some(&opp.description)),
        caps = ctx.capability_lines(),
    );
    Prompt {
        system: "You are an expert RFP analyst. Respond only with valid JSON.".to_string(),
        user,
    }
}

/// Output budget scaled to description length; reasoning models spend most of it thinking.
pub fn deep_output_tokens(opp: &Opportunity) -> u32 {
    match opp.description.chars().count() {
        0..=999 => 8_000,
        1_000..=4_999 => 12_000,
        _ => 15_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opportunity(description: &str) -> Opportunity {
        serde_json::from_value(serde_json::json!({
            "noticeId": "N-42",
            "title": "Records digitization",
            "description": description,
        }))
        .unwrap()
    }

    #[test]
    fn prompts_carry_notice_id_and_missing_fields_as_na() {
        let ctx = EvaluationContext::from_profile(&CompanyProfile::default());
        let prompt = mini_prompt(&ctx, &opportunity("scan paper records"));
        assert!(prompt.user.contains("Notice ID: N-42"));
        assert!(prompt.user.contains("NAICS: N/A"));
        assert!(prompt.user.contains("YOUR_COMPANY"));

        let mut profile = CompanyProfile::default();
        profile.company.past_performance = vec!["VA claims intake, 2023".to_string()];
        let deep = deep_prompt(&EvaluationContext::from_profile(&profile), &opportunity(""));
        assert!(deep.user.contains("Notice ID: N-42"));
        assert!(deep.user.contains("VA claims intake, 2023"));
        assert!(deep.user.contains("FULL DESCRIPTION:\nN/A"));
    }

    #[test]
    fn mini_prompt_truncates_long_descriptions() {
        let ctx = EvaluationContext::from_profile(&CompanyProfile::default());
        let long = "x".repeat(MINI_DESCRIPTION_CHARS + 500);
        let prompt = mini_prompt(&ctx, &opportunity(&long));
        assert!(!prompt.user.contains(&long));
        assert!(prompt.user.contains(&"x".repeat(MINI_DESCRIPTION_CHARS)));
    }

    #[test]
    fn output_budget_grows_with_description() {
        assert_eq!(deep_output_tokens(&opportunity("short")), 8_000);
        assert_eq!(deep_output_tokens(&opportunity(&"a".repeat(2_000))), 12_000);
        assert_eq!(deep_output_tokens(&opportunity(&"a".repeat(9_000))), 15_000);
    }
}
