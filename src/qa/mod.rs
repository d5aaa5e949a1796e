//! Question answering over one document

pub mod manager;
pub mod prompts;
pub mod protocol;

pub use manager::QaManager;
pub use protocol::{
    parse_request, AskRequest, QaRequest, QaResponse, StreamEvent, TurnOutcome, TurnResult,
};
