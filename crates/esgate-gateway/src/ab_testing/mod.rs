//! A/B-testing dispatch: sender, collectors and the coordinator that keeps
//! a healthy collector wired into the sender.

mod collector;
mod coordinator;
mod sender;

pub use collector::{
    CollectorError, CollectorFactory, DocumentSink, EnrichedResult, InMemoryCollector,
    InMemoryCollectorFactory, Mismatch, REDACTED, ResponseMismatch, ResultSink, TracingSink,
    compare_bodies,
};
pub use coordinator::SenderCoordinator;
pub use sender::{DispatchingSender, NoopSender, SenderControl, SenderLoop};
