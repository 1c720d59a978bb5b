mod chat;
mod derive;
mod relevance;

pub use chat::{message_content, strip_json_fences, ChatClient, ChatProvider, ChatRequest};
pub use derive::MetadataDeriver;
pub use relevance::{Evaluation, RelevanceFilter, FAIL_OPEN_REASON};

#[cfg(test)]
pub(crate) use chat::testing;
