//! Safety gate: the admissibility check that runs before any generation work.
//!
//! Injection screening always runs first. The clarification checks (too
//! vague, off-topic, self-contradictory) only run on input that passed it.

use std::sync::LazyLock;

use regex::{Regex, RegexSet};

use advocate_types::{AdvocateError, GateVerdict, Result};

pub const REASON_TOO_VAGUE: &str = "input too vague";
pub const REASON_OFF_TOPIC: &str = "input is off-topic for animal advocacy";
pub const REASON_CONTRADICTORY: &str = "input asks to both defend and attack the same position";

/// Known override phrasings, keyed by the name recorded in audit logs. Each
/// one is anchored on wording aimed at the assistant itself, so a comment
/// that merely says someone "ignores the guidelines" passes.
const INJECTION_PATTERNS: &[(&str, &str)] = &[
    (
        "ignore_previous_instructions",
        r"(?is)\b(ignore|disregard|forget|override|bypass)\b.{0,30}\b(previous|prior|above|earlier|preceding|initial|original|system)\s+(instructions?|prompts?|rules|directions|messages)\b|\b(ignore|disregard|forget|override|bypass)\s+(all\s+(of\s+)?)?your\s+((previous|prior|earlier|original)\s+)?(instructions?|prompts?|rules|guidelines|programming|system\s+prompt)\b",
    ),
    (
        "reveal_system_prompt",
        r"(?is)\b(reveal|show|print|display|repeat|output|leak|tell me|give me|what (is|are))\b.{0,40}\b(system|hidden|internal|initial|original|secret)\s+(prompt|instructions?|message|rules?|configuration)\b",
    ),
    (
        "reveal_strategy_catalog",
        r"(?is)\b(list|reveal|show|dump|print|output|give me)\b.{0,30}\b(all|every|your|internal|the)\b.{0,30}\b(strateg(y|ies)|persuasion techniques|playbook|corpus|catalog(ue)?)\b",
    ),
    (
        "role_override",
        r"(?is)\b(you\s+are\s+now|you're\s+now|from\s+now\s+on,?\s+you\s+are|pretend\s+(to\s+be|you\s+are|you're)|act\s+as)\s+(an?\s+|my\s+|the\s+)?(\w+\s+){0,2}(assistant|ai|bot|chatbot|model|gpt|llm|dan|developer|admin|administrator|persona|character)\b|\bfrom\s+now\s+on,?\s+(you\s+(will|must|should|shall)\s+)?(only\s+)?(respond|reply|answer|speak|write|talk)\b",
    ),
    (
        "jailbreak_keyword",
        r"(?i)\b(jailbreak|developer mode|dan mode|do anything now)\b",
    ),
    (
        "fake_role_delimiter",
        r"(?im)(^\s*(system|assistant)\s*:|</?\s*(system|instructions?|comment|draft)\s*>)",
    ),
];

/// Words that place input inside the advocacy domain. Short entries must
/// match a whole word (optionally plural); longer ones match as prefixes.
const DOMAIN_TERMS: &[&str] = &[
    // food and products
    "vegan", "vegetarian", "veg", "vegg", "plant", "meat", "beef", "pork", "chicken", "bacon",
    "steak", "burger", "hamburger", "ham", "sausage", "jerky", "fish", "salmon", "tuna", "shrimp",
    "sushi", "seafood", "dairy", "milk", "cheese", "egg", "butter", "honey", "gelatin", "leather",
    "wool", "fur", "soy", "tofu", "lentil", "bean", "vegetable", "fruit", "grain", "crop",
    "organic", "kosher", "halal", "recipe", "cook", "food", "eat", "eating", "ate", "eaten",
    "meal", "plate", "dinner", "lunch", "breakfast", "grocer", "restaurant", "hungry", "hunger",
    "diet", "protein", "nutri", "b12", "iron", "carb", "health",
    // animals, farmed and wild
    "animal", "creature", "beast", "mammal", "species", "cow", "pig", "hen", "chick", "lamb",
    "sheep", "goat", "duck", "turkey", "horse", "bird", "insect", "bee", "dog", "cat", "pet",
    "livestock", "cattle", "poultry", "lion", "tiger", "wolf", "wolves", "bear", "shark", "wild",
    "predator", "prey", "carnivor", "omnivor", "herbivor",
    // practices and arguments
    "farm", "factory", "slaughter", "hunt", "fishing", "zoo", "circus", "lab", "cruel", "welfare",
    "rights", "compassion", "suffer", "pain", "kill", "ethic", "moral", "sentien", "natur",
    "instinct", "evol", "ancestor", "caveman", "cavemen", "food chain", "environment", "climate",
    "planet", "steward",
];

const DEFEND_RE: &str = r"(?im)(^|[.!?;:]\s*|\b(please|can you|could you|would you|now|first|also|then)\s+)(defend|argue for|make the case for|justify|back up)\b";
const ATTACK_RE: &str = r"(?im)(^|[.!?;:]\s*|\b(please|can you|could you|would you|now|also|then|and|but)\s+)(attack|argue against|refute|debunk|tear (it )?apart|rebut)\b";

/// Compiled once per process.
struct GatePatterns {
    injection_set: RegexSet,
    defend: Regex,
    attack: Regex,
}

impl GatePatterns {
    fn compile() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            injection_set: RegexSet::new(INJECTION_PATTERNS.iter().map(|(_, re)| *re))?,
            defend: Regex::new(DEFEND_RE)?,
            attack: Regex::new(ATTACK_RE)?,
        })
    }
}

// The patterns are constants, so this is either always Ok or always Err;
// `static_patterns_compile` below pins the Ok case.
static PATTERNS: LazyLock<std::result::Result<GatePatterns, regex::Error>> =
    LazyLock::new(GatePatterns::compile);

pub struct SafetyGate {
    patterns: &'static GatePatterns,
    min_chars: usize,
    min_words: usize,
}

impl SafetyGate {
    pub fn new(min_chars: usize, min_words: usize) -> Result<Self> {
        let patterns = PATTERNS
            .as_ref()
            .map_err(|e| AdvocateError::ConfigError(format!("safety gate pattern: {e}")))?;
        Ok(Self {
            patterns,
            min_chars,
            min_words,
        })
    }

    /// Classify a submission. Non-admissible verdicts are logged for abuse
    /// tracking before they are returned.
    pub fn evaluate(&self, raw_input: &str, draft_reply: Option<&str>) -> GateVerdict {
        let verdict = self.classify(raw_input, draft_reply);
        log_verdict(&verdict, raw_input);
        verdict
    }

    /// Screen free-text feedback. Only the injection check applies; a short
    /// or off-topic critique is fine.
    pub fn screen_feedback(&self, critique: &str) -> GateVerdict {
        let verdict = match self.injection_match(critique) {
            Some(pattern) => GateVerdict::InjectionSuspected {
                pattern: pattern.to_string(),
            },
            None => GateVerdict::Admissible,
        };
        log_verdict(&verdict, critique);
        verdict
    }

    fn classify(&self, raw_input: &str, draft_reply: Option<&str>) -> GateVerdict {
        let draft = draft_reply.map(str::trim).filter(|d| !d.is_empty());

        for text in std::iter::once(raw_input).chain(draft) {
            if let Some(pattern) = self.injection_match(text) {
                return GateVerdict::InjectionSuspected {
                    pattern: pattern.to_string(),
                };
            }
        }

        if self.too_vague(raw_input) && draft.map_or(true, |d| self.too_vague(d)) {
            return clarify(REASON_TOO_VAGUE);
        }

        let combined = match draft {
            Some(d) => format!("{raw_input}\n{d}"),
            None => raw_input.to_string(),
        };

        if !mentions_domain(&combined) {
            return clarify(REASON_OFF_TOPIC);
        }

        if self.asks_both_ways(&combined) {
            return clarify(REASON_CONTRADICTORY);
        }

        GateVerdict::Admissible
    }

    /// Both an imperative "defend" and an imperative "attack" aimed at the
    /// assistant. Verbs in the middle of a third-party comment don't count.
    fn asks_both_ways(&self, text: &str) -> bool {
        self.patterns.defend.is_match(text) && self.patterns.attack.is_match(text)
    }

    fn injection_match(&self, text: &str) -> Option<&'static str> {
        self.patterns
            .injection_set
            .matches(text)
            .iter()
            .next()
            .map(|idx| INJECTION_PATTERNS[idx].0)
    }

    fn too_vague(&self, text: &str) -> bool {
        let trimmed = text.trim();
        trimmed.chars().count() < self.min_chars || words(trimmed).count() < self.min_words
    }
}

fn clarify(reason: &str) -> GateVerdict {
    GateVerdict::NeedsClarification {
        reason: reason.to_string(),
    }
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

fn mentions_domain(text: &str) -> bool {
    let lower = text.to_lowercase();
    if DOMAIN_TERMS
        .iter()
        .any(|term| term.contains(' ') && lower.contains(term))
    {
        return true;
    }
    let hit = words(&lower).any(|word| {
        DOMAIN_TERMS.iter().any(|term| {
            if term.len() >= 4 {
                word.starts_with(term)
            } else {
                word == *term || word.strip_suffix('s') == Some(term)
            }
        })
    });
    hit
}

fn log_verdict(verdict: &GateVerdict, text: &str) {
    let excerpt: String = text.chars().take(200).collect();
    match verdict {
        GateVerdict::Admissible => {}
        GateVerdict::InjectionSuspected { pattern } => {
            tracing::warn!(
                target: "advocate::audit",
                pattern = %pattern,
                input_len = text.len(),
                excerpt = %excerpt,
                "Injection suspected; turn halted"
            );
        }
        GateVerdict::NeedsClarification { reason } => {
            tracing::info!(
                target: "advocate::audit",
                reason = %reason,
                input_len = text.len(),
                "Clarification needed; turn halted"
            );
        }
    }
}
