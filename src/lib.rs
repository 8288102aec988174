pub mod codec;
pub mod config;
pub mod message;
pub mod milter;
pub mod protocol;
pub mod rewrite;
pub mod rules;
pub mod session;

pub use config::{ConfigError, FileConfig, Settings};
pub use message::{HeaderEntry, MessageContext};
pub use milter::Milter;
pub use rewrite::{HeaderAction, RewriteEngine};
pub use rules::{should_rewrite, RequireRules, RequireValue};
pub use session::{Session, SessionState};
