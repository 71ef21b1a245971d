//! Resilient outbound request pipeline.

pub mod body;
pub mod dispatcher;
pub mod ladder;

pub use body::OutboundBody;
pub use dispatcher::{DispatchOutcome, Dispatcher, OutboundRequest};
pub use ladder::{Ladder, LadderStep, ResponseClass};
