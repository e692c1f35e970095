pub mod openai;
pub mod retry;

pub use openai::{strip_code_fences, OpenAiClient};
pub use retry::{with_backoff, RetryPolicy};
