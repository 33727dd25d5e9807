pub mod engine;
pub mod events;
pub mod state;
mod sweep;

pub use engine::{EngineStats, SessionEngine};
pub use events::SessionEvent;
pub use state::{Connection, ConnectionState, PendingSubscribe, PendingUnsubscribe};
pub use sweep::SweepReport;
