pub mod cli;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod message;
pub mod prompts;
pub mod routing;
pub mod samples;
pub mod state;
pub mod store;
pub mod value;

// Re-export main types
pub use dispatch::{DispatchConfig, DispatchError, Dispatcher, InboundEvent, Payload, TurnOutcome};
pub use engine::{
    run_turn, Dialog, DialogContext, DialogRegistry, DialogResult, EngineConfig, Fiber, Outcome,
    RootDialog, TurnInput, TurnResult, TurnScope,
};
pub use error::{EngineError, ErrorInfo, ProtocolViolation};
pub use message::{MessageSink, OutgoingMessage};
pub use state::{Bag, ConversationIdentity, Partition, StateKey};
pub use store::{InMemoryStateStore, PgStateStore, StateStore, StoreError};
pub use value::{Val, ValType};
