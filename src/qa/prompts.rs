//! Prompt text per use case

use crate::context::models::UseCase;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You answer questions about a single document using only \
the numbered context passages you are given. Cite passages by their number. If the passages do \
not contain the answer, say so.";

const RESPONSE_FORMAT: &str = "Respond with a JSON object: \"answer\" holds your answer in \
Markdown (LaTeX math allowed), \"sources\" lists the numbers of the passages you used.";

fn instruction(use_case: UseCase) -> &'static str {
    match use_case {
        UseCase::Chat => "Answer the question.",
        UseCase::Summary => "Summarize the passages, keeping the main claims and results.",
        UseCase::Explain => "Explain the requested passage in plain language.",
        UseCase::Analysis => "Analyze the methods, evidence and limitations in the passages.",
        UseCase::Glossary => "Define the key terms that appear in the passages.",
    }
}

/// System prompt for a use case
pub fn system_prompt(base: &str, use_case: UseCase) -> String {
    format!("{}\n\n{}", base, RESPONSE_FORMAT)
        + if use_case == UseCase::Chat {
            ""
        } else {
            "\nThis is a one-off request; there is no prior conversation."
        }
}

/// User turn carrying the evidence block and the question
pub fn user_prompt(use_case: UseCase, doc_title: &str, evidence: &str, question: &str) -> String {
    format!(
        "Context passages from \"{}\":\n\n{}\n\n{}\n\nRequest: {}",
        doc_title,
        evidence,
        instruction(use_case),
        question
    )
}
