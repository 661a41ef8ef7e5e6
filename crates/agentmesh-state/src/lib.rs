//! Per-agent view of the network: who is out there, what they can do, and
//! how reliable they have been.

pub mod interaction;
pub mod matcher;
pub mod mesh;
pub mod registry;

pub use interaction::{InteractionRecord, InteractionSummary, InteractionTracker};
pub use matcher::{find_best_agents, ranked_matches, AgentMatch};
pub use mesh::{MeshState, RegistryEffect};
pub use registry::{AgentRegistry, RegistryEntry, StatusCounts, UpsertOutcome};
