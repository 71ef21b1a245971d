pub mod chat;

pub use chat::{
    ChatChunk, ChatChunkChoice, ChatChunkDelta, ChatCompletion, ChatCompletionChoice,
    ChatCompletionMessage, ChatErrorBody, ChatErrorObject, ChatMessage, ContentPart, MessageContent,
};
