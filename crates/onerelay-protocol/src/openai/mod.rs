pub mod billing;
pub mod create_chat_completions;
pub mod create_completions;
pub mod create_images;
pub mod error;
pub mod usage;

pub use error::{CanonicalError, OpenAIError, OpenAIErrorResponse};
pub use usage::Usage;
