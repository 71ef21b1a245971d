mod error;
mod request;
mod response;

pub use error::{ChatErrorBody, ChatErrorObject};
pub use request::{ChatMessage, ContentPart, MessageContent};
pub use response::{
    ChatChunk, ChatChunkChoice, ChatChunkDelta, ChatCompletion, ChatCompletionChoice,
    ChatCompletionMessage,
};
