use serde::Deserialize;

use advocate_types::Result;

use crate::prompts;
use crate::reply::strip_em_dashes;
use crate::structured::{StageOutput, StructuredCaller};

#[derive(Debug, Deserialize)]
pub struct RebuttalOutput {
    pub rebuttal: String,
}

impl StageOutput for RebuttalOutput {
    const STAGE: &'static str = "rebuttal";
    const SCHEMA: &'static str = r#"{"rebuttal": string}"#;

    fn check(&self) -> std::result::Result<(), String> {
        if self.rebuttal.trim().is_empty() {
            Err("rebuttal must not be empty".into())
        } else {
            Ok(())
        }
    }
}

/// Produces the strongest skeptical answer a reader might give to a reply.
pub struct RebuttalGenerator {
    caller: StructuredCaller,
}

impl RebuttalGenerator {
    pub fn new(caller: StructuredCaller) -> Self {
        Self { caller }
    }

    pub async fn critique(&self, reply: &str) -> Result<String> {
        let output: RebuttalOutput = self
            .caller
            .call(prompts::rebuttal_messages(reply), |_: &RebuttalOutput| Ok(()))
            .await?;
        Ok(strip_em_dashes(output.rebuttal.trim()))
    }
}
