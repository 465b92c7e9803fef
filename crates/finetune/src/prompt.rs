//! Alpaca-style instruction prompts.

use serde::{Deserialize, Serialize};

const PREAMBLE_WITH_INPUT: &str = "Below is an instruction that describes a task, paired with an input that provides further context. Write a response that appropriately completes the request.";
const PREAMBLE: &str =
    "Below is an instruction that describes a task. Write a response that appropriately completes the request.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionSample {
    pub instruction: String,
    #[serde(default)]
    pub input: String,
}

impl InstructionSample {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            input: String::new(),
        }
    }
}

/// Formats `sample`; the input section is omitted when the input is empty.
pub fn generate_prompt(sample: &InstructionSample) -> String {
    if sample.input.is_empty() {
        format!(
            "{PREAMBLE}\n\n### Instruction:\n{}\n\n### Response:",
            sample.instruction
        )
    } else {
        format!(
            "{PREAMBLE_WITH_INPUT}\n\n### Instruction:\n{}\n\n### Input:\n{}\n\n### Response:",
            sample.instruction, sample.input
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omits_empty_input_section() {
        let prompt = generate_prompt(&InstructionSample::new("Say hi."));
        assert!(prompt.starts_with(PREAMBLE));
        assert!(prompt.ends_with("### Instruction:\nSay hi.\n\n### Response:"));
        assert!(!prompt.contains("### Input:"));
    }

    #[test]
    fn includes_input_when_present() {
        let sample = InstructionSample {
            instruction: "Translate.".into(),
            input: "bonjour".into(),
        };
        let prompt = generate_prompt(&sample);
        assert!(prompt.contains("paired with an input"));
        assert!(prompt.ends_with("### Input:\nbonjour\n\n### Response:"));
    }
}
