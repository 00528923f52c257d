use serde::Deserialize;

use advocate_types::{Feedback, InputKind, Result, RetrievedStrategy};

use crate::feedback::PriorTurnContext;
use crate::prompts;
use crate::structured::{StageOutput, StructuredCaller};

#[derive(Debug, Deserialize)]
pub struct ReplyOutput {
    pub reply: String,
    pub rationale: String,
    #[serde(default)]
    pub input_type: Option<String>,
}

impl StageOutput for ReplyOutput {
    const STAGE: &'static str = "reply";
    const SCHEMA: &'static str =
        r#"{"reply": string, "rationale": string, "input_type": "draft_reply" | "comment"}"#;

    fn check(&self) -> std::result::Result<(), String> {
        if self.reply.trim().is_empty() {
            return Err("reply must not be empty".into());
        }
        if self.rationale.trim().is_empty() {
            return Err("rationale must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftedReply {
    pub reply: String,
    pub rationale: String,
    pub input_kind: InputKind,
}

pub struct ReplyGenerator {
    caller: StructuredCaller,
}

impl ReplyGenerator {
    pub fn new(caller: StructuredCaller) -> Self {
        Self { caller }
    }

    pub async fn generate(
        &self,
        raw_input: &str,
        draft_reply: Option<&str>,
        strategies: &[RetrievedStrategy],
    ) -> Result<DraftedReply> {
        let messages = prompts::reply_messages(raw_input, draft_reply, strategies);
        let output: ReplyOutput = self
            .caller
            .call(messages, |out: &ReplyOutput| no_catalog_leak(out, strategies))
            .await?;
        Ok(finish(output, draft_reply.is_some()))
    }

    /// Rewrite the prior reply under feedback. The new reply must differ from
    /// the old one after normalization.
    pub async fn revise(
        &self,
        context: &PriorTurnContext,
        feedback: &Feedback,
        guidance: &[String],
    ) -> Result<DraftedReply> {
        let messages = prompts::revision_messages(context, feedback, guidance);
        let previous = comparable(&context.reply);
        let output: ReplyOutput = self
            .caller
            .call(messages, |out: &ReplyOutput| {
                no_catalog_leak(out, &context.strategies)?;
                if comparable(&out.reply) == previous {
                    return Err("the new reply repeats the previous reply; change it".into());
                }
                Ok(())
            })
            .await?;
        Ok(finish(output, context.draft_reply.is_some()))
    }
}

/// Ids are matched in any case. Names read like ordinary phrases ("active
/// listening"), so they only count when quoted or written as a title.
fn no_catalog_leak(
    out: &ReplyOutput,
    strategies: &[RetrievedStrategy],
) -> std::result::Result<(), String> {
    let text = format!("{}\n{}", out.reply, out.rationale);
    let lower = text.to_lowercase();
    let leaked = strategies.iter().any(|s| {
        lower.contains(&s.strategy_id.to_lowercase())
            || names_as_label(&text, &lower, &s.name)
    });
    if leaked {
        Err("do not mention internal technique identifiers".into())
    } else {
        Ok(())
    }
}

fn names_as_label(text: &str, lower: &str, name: &str) -> bool {
    let name_lower = name.to_lowercase();
    let quoted = [('"', '"'), ('\'', '\''), ('\u{201c}', '\u{201d}'), ('\u{2018}', '\u{2019}')]
        .iter()
        .any(|(open, close)| lower.contains(&format!("{open}{name_lower}{close}")));
    quoted || text.contains(&title_case(name))
}

/// "Low-pressure ask" becomes "Low-Pressure Ask".
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_word_start = true;
    for c in name.chars() {
        if at_word_start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = c.is_whitespace() || c == '-';
    }
    out
}

fn finish(output: ReplyOutput, has_draft: bool) -> DraftedReply {
    let input_kind = if has_draft {
        InputKind::DraftReply
    } else {
        match output.input_type.as_deref().map(str::trim) {
            Some("draft_reply") => InputKind::DraftReply,
            _ => InputKind::Comment,
        }
    };
    DraftedReply {
        reply: strip_em_dashes(output.reply.trim()),
        rationale: strip_em_dashes(output.rationale.trim()),
        input_kind,
    }
}

/// Replace em dashes with a spaced hyphen.
pub fn strip_em_dashes(text: &str) -> String {
    text.replace(" \u{2014} ", " - ").replace('\u{2014}', " - ")
}

fn comparable(text: &str) -> String {
    strip_em_dashes(text)
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(reply: &str, input_type: Option<&str>) -> ReplyOutput {
        ReplyOutput {
            reply: reply.into(),
            rationale: "Because it meets them where they are.".into(),
            input_type: input_type.map(String::from),
        }
    }

    #[test]
    fn em_dashes_are_replaced() {
        assert_eq!(strip_em_dashes("Fair point \u{2014} I agree"), "Fair point - I agree");
        assert_eq!(strip_em_dashes("plants\u{2014}all of them"), "plants - all of them");
    }

    #[test]
    fn draft_forces_draft_reply_kind() {
        let d = finish(output("Hi", Some("comment")), true);
        assert_eq!(d.input_kind, InputKind::DraftReply);
    }

    #[test]
    fn input_kind_defaults_to_comment() {
        assert_eq!(finish(output("Hi", None), false).input_kind, InputKind::Comment);
        assert_eq!(finish(output("Hi", Some("unknown")), false).input_kind, InputKind::Comment);
        assert_eq!(
            finish(output("Hi", Some("draft_reply")), false).input_kind,
            InputKind::DraftReply
        );
    }

    #[test]
    fn strategy_ids_in_output_are_rejected() {
        let strategies = vec![RetrievedStrategy {
            strategy_id: "low-pressure-ask".into(),
            name: "Low-pressure ask".into(),
            principle: "Close with one small step".into(),
            score: 0.3,
        }];
        assert!(no_catalog_leak(&output("Using low-pressure-ask here", None), &strategies).is_err());
        assert!(no_catalog_leak(&output("A Low-Pressure Ask works", None), &strategies).is_err());
        assert!(no_catalog_leak(&output("Try one meal this week", None), &strategies).is_ok());
    }

    #[test]
    fn strategy_names_in_plain_wording_are_allowed() {
        let strategies = vec![RetrievedStrategy {
            strategy_id: "active-listening".into(),
            name: "Active listening".into(),
            principle: "Acknowledge their point before responding".into(),
            score: 0.4,
        }];
        let mut out = output("I hear you, it is hard to change habits.", None);
        out.rationale = "Acknowledging them first (active listening) lowers defenses.".into();
        assert!(no_catalog_leak(&out, &strategies).is_ok());

        out.rationale = "This applies \"Active listening\" to lower defenses.".into();
        assert!(no_catalog_leak(&out, &strategies).is_err());

        out.rationale = "Uses the Active Listening technique.".into();
        assert!(no_catalog_leak(&out, &strategies).is_err());
    }

    #[test]
    fn title_case_capitalizes_hyphenated_words() {
        assert_eq!(title_case("Low-pressure ask"), "Low-Pressure Ask");
        assert_eq!(title_case("Invite allyship, not conversion"), "Invite Allyship, Not Conversion");
    }

    #[test]
    fn comparable_ignores_case_and_spacing() {
        assert_eq!(comparable("Try  one MEAL"), comparable("try one meal"));
    }

    #[test]
    fn empty_reply_fails_check() {
        assert!(output("  ", None).check().is_err());
    }
}
