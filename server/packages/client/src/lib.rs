//! Client side of chat-relay: a thin HTTP client plus the recovery agent
//! that reconnects interrupted turns and replays what was missed.

pub mod backoff;
pub mod client;
pub mod ndjson;
pub mod recovery;
pub mod session;

pub use backoff::RetryPolicy;
pub use client::{ChatClient, ClientError, LiveEntries};
pub use recovery::{
    MessageProcessor, RecoveryAgent, RecoveryError, RecoveryOutcome, RecoveryPhase,
    RecoveryState, ResumeApi,
};
pub use session::{ChatSession, ChatTransport, TurnError, TurnOutcome};
