pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod stream;
pub mod trace;

pub use capability::ProviderCapabilities;
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, HookOutcome, HookResult};
pub use message::{ContentBlock, Message, MessageContent, Role, ToolCall, ToolSpec};
pub use stream::{BoxStream, StreamEvent, Usage};
pub use trace::TraceEvent;
