use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseLevel {
    Simple,
    Standard,
    Detailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Procedural,
    Comparison,
    Eligibility,
    FactualLookup,
    Definition,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    StepByStep,
    Comparative,
    Explanatory,
    Concise,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueryType::Procedural => "procedural",
            QueryType::Comparison => "comparison",
            QueryType::Eligibility => "eligibility",
            QueryType::FactualLookup => "factual_lookup",
            QueryType::Definition => "definition",
            QueryType::General => "general",
        };
        f.write_str(label)
    }
}

/// Length, breadth and style budget for one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePolicy {
    pub level: ResponseLevel,
    pub max_tokens: u32,
    pub top_n: usize,
    pub style_instruction: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub policy: ResponsePolicy,
    pub query_type: QueryType,
    pub mode: ResponseMode,
}

const SIMPLE_STYLE: &str =
    "Give a short, direct answer in two or three sentences. Define terms plainly.";
const STANDARD_STYLE: &str =
    "Give a clear explanation in a few short paragraphs, leading with the direct answer.";
const DETAILED_STYLE: &str = "Give a thorough answer. Use numbered steps for procedures and \
     side-by-side bullets for comparisons. Mention the relevant form numbers.";
const LOOKUP_STYLE: &str =
    "Lead with the exact figure, date or limit, then add one sentence of context.";

/// Budget used when the pipeline falls back after an error.
pub const FALLBACK_POLICY: ResponsePolicy = ResponsePolicy {
    level: ResponseLevel::Simple,
    max_tokens: 250,
    top_n: 2,
    style_instruction: SIMPLE_STYLE,
};

struct Rule {
    query_type: QueryType,
    mode: ResponseMode,
    policy: ResponsePolicy,
    triggers: &'static [&'static str],
}

const RULES: [Rule; 5] = [
    Rule {
        query_type: QueryType::Procedural,
        mode: ResponseMode::StepByStep,
        policy: ResponsePolicy {
            level: ResponseLevel::Detailed,
            max_tokens: 700,
            top_n: 4,
            style_instruction: DETAILED_STYLE,
        },
        triggers: &["how do i", "how to", "how can i", "steps", "apply for", "where do i"],
    },
    Rule {
        query_type: QueryType::Comparison,
        mode: ResponseMode::Comparative,
        policy: ResponsePolicy {
            level: ResponseLevel::Detailed,
            max_tokens: 700,
            top_n: 5,
            style_instruction: DETAILED_STYLE,
        },
        triggers: &["difference between", " vs ", "versus", "compare"],
    },
    Rule {
        query_type: QueryType::Eligibility,
        mode: ResponseMode::Explanatory,
        policy: ResponsePolicy {
            level: ResponseLevel::Standard,
            max_tokens: 450,
            top_n: 3,
            style_instruction: STANDARD_STYLE,
        },
        triggers: &["eligib", "qualify", "who can", "am i", "can i"],
    },
    Rule {
        query_type: QueryType::FactualLookup,
        mode: ResponseMode::Concise,
        policy: ResponsePolicy {
            level: ResponseLevel::Standard,
            max_tokens: 350,
            top_n: 3,
            style_instruction: LOOKUP_STYLE,
        },
        triggers: &["when", "how much", "deadline", "due", "limit", "rate", "amount"],
    },
    Rule {
        query_type: QueryType::Definition,
        mode: ResponseMode::Concise,
        policy: FALLBACK_POLICY,
        triggers: &["what is", "what are", "define", "meaning of"],
    },
];

const GENERAL_POLICY: ResponsePolicy = ResponsePolicy {
    level: ResponseLevel::Standard,
    max_tokens: 500,
    top_n: 3,
    style_instruction: STANDARD_STYLE,
};

static YEAR: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\b\d{4}\b").ok());

/// Picks exactly one policy from the query text alone. First matching rule
/// wins; anything unmatched is `general`.
pub fn classify(query: &str) -> Classification {
    let normalized = format!(" {} ", query.trim().to_lowercase());

    for rule in &RULES {
        if rule_matches(rule, query, &normalized) {
            return Classification {
                policy: rule.policy,
                query_type: rule.query_type,
                mode: rule.mode,
            };
        }
    }

    Classification {
        policy: GENERAL_POLICY,
        query_type: QueryType::General,
        mode: ResponseMode::Explanatory,
    }
}

fn rule_matches(rule: &Rule, raw: &str, normalized: &str) -> bool {
    if rule.triggers.iter().any(|trigger| normalized.contains(trigger)) {
        return true;
    }
    match rule.query_type {
        QueryType::FactualLookup => YEAR.as_ref().is_some_and(|year| year.is_match(raw)),
        QueryType::Definition => raw.split_whitespace().count() <= 3,
        _ => false,
    }
}
