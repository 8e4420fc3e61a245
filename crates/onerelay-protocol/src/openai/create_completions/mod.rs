pub mod request;
pub mod response;
pub mod stream;

pub use request::CreateCompletionRequestBody;
pub use response::{CompletionChoice, CreateCompletionResponse};
pub use stream::{CompletionStreamChoice, CreateCompletionStreamResponse};
