pub mod openai;

pub use openai::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, ClientError, Message, OpenAiClient,
    OpenAiClientTrait,
};
