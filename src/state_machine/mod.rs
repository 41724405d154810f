// State machine module for command orchestration
//
// Explicit finite-state machine for the OTA command lifecycle with a
// persistence write after every transition.

pub mod command_state_machine;
pub mod errors;
pub mod events;
pub mod persistence;
pub mod states;

// Re-export main types for convenient access
pub use command_state_machine::{determine_target_state, CommandStateMachine, StageTimeouts};
pub use errors::{PersistenceError, PersistenceResult, StateMachineError, StateMachineResult};
pub use events::CommandEvent;
pub use persistence::{CreateOutcome, InMemoryInstanceStore, InstanceStore};
pub use states::CommandState;
