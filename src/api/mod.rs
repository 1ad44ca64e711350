//! Boundary with the outside world: execution venues, market events and
//! outbound engine events.

mod events;
mod paper;
mod types;

pub use events::{ChannelSink, EngineEvent, EventSink, FanoutSink, LogSink};
pub use paper::PaperVenue;
pub use types::{CancelOutcome, ExecutionVenue, MarketEvent, OrderAck, VenueOrder};
