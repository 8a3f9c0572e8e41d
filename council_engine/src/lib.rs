//! Advisor Council Engine - Core Library
//!
//! Routes a request to a council of specialized advisors, blends their
//! proposals into one answer, and keeps learning which advisors to ask.

pub mod advisor;
pub mod cli;
pub mod engine;
pub mod error;
pub mod learning;
pub mod ledger;
pub mod memory;
pub mod nursery;
pub mod orchestrator;
pub mod ranking;
pub mod registry;
pub mod router;
pub mod settings;
pub mod synthesizer;
pub mod telemetry;
pub mod topics;

pub use advisor::{Advisor, AdvisorDescriptor, Proposal};
pub use engine::{EchoEngine, EngineError, TextEngine};
pub use error::{CouncilError, Result};
pub use learning::{Feedback, OutcomeSignal};
pub use orchestrator::Council;
pub use router::{CouncilRequest, CouncilResponse, RoutingMode};
