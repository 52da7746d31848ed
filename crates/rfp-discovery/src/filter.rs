use tracing::debug;

use crate::model::Opportunity;

/// Titles that are never technology work. "maintenance", "security" and "support" are not
/// listed; those titles are often IT work.
const SKIP_TITLE_KEYWORDS: &[&str] = &[
    "janitorial",
    "custodial",
    "lawn",
    "mowing",
    "landscaping",
    "food service",
    "cafeteria",
    "laundry",
    "uniform rental",
    "pest control",
    "trash removal",
    "refuse collection",
    "plumbing",
    "electrical work",
    "hvac repair",
    "roofing",
    "painting",
    "carpet cleaning",
    "window washing",
];

/// Notices that announce a decision rather than solicit work.
const SKIP_NOTICE_TYPES: &[&str] = &["Award", "Justification"];

#[derive(Debug, Default)]
pub struct PrefilterOutcome {
    pub kept: Vec<Opportunity>,
    pub dropped: usize,
}

pub fn is_obviously_irrelevant(opp: &Opportunity) -> bool {
    let title = opp.title.to_lowercase();
    SKIP_TITLE_KEYWORDS.iter().any(|k| title.contains(k))
        || SKIP_NOTICE_TYPES
            .iter()
            .any(|t| opp.notice_type.eq_ignore_ascii_case(t))
}

pub fn prefilter(items: Vec<Opportunity>) -> PrefilterOutcome {
    let total = items.len();
    let kept: Vec<Opportunity> = items
        .into_iter()
        .filter(|o| {
            let skip = is_obviously_irrelevant(o);
            if skip {
                debug!(id = %o.id, title = %o.short_title(60), "prefilter drop");
            }
            !skip
        })
        .collect();
    PrefilterOutcome {
        dropped: total - kept.len(),
        kept,
    }
}
