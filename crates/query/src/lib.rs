pub mod context;
pub mod engine;
pub mod intent;
pub mod response;

pub use context::{ContextEntry, Relation};
pub use engine::{QueryConfig, QueryEngine};
pub use intent::{Calculation, Direction, IntentClassifier, IntentKind, QueryEntities, QueryIntent};
pub use response::{QueryOutcome, QueryResponse, QueryState, QueryTrace, RetrievedMatch};
