pub mod request;
pub mod response;
pub mod stream;
pub mod types;

pub use request::CreateChatCompletionRequestBody;
pub use response::{ChatCompletionChoice, CreateChatCompletionResponse};
pub use stream::{ChatCompletionStreamChoice, CreateChatCompletionStreamResponse};
pub use types::{ChatCompletionDelta, ChatMessage};
