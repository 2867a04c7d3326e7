pub mod completion;
pub mod config;
pub mod constants;
pub mod conversation;
pub mod emotion;
pub mod prompt;
pub mod session;
pub mod web_server;

pub use completion::{
    CompletionClient, CompletionError, CompletionRequest, FragmentStream, OpenAiClient,
};
pub use config::{ConfigError, Credential, Model, RequestConfig};
pub use conversation::{ConversationHistory, Message, Role};
pub use emotion::{resolve_emotion, EmotionState};
pub use session::{ClientEvent, Phase, ServerEvent, SessionController, SessionState, SessionView};
