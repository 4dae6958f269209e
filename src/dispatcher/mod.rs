//! Event dispatch between generators, matchers and subscribers.
//!
//! Generators publish primitive events through an [`EventPublisher`]. The
//! dispatcher routes every event to the matchers registered for its kind and
//! to external [`EventStream`]s; derived events produced by matchers are fed
//! back in, so complex matchers see the output of simple ones.

/// Router worker and registration.
#[allow(clippy::module_inception)]
pub mod dispatcher;
/// Matcher and subscription identifiers.
pub mod ids;
/// Backlog-aware delivery and publisher handle.
pub mod publisher;
/// Subscriber stream handle.
pub mod stream;
mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use ids::{MatcherId, SubscriptionId};
pub use publisher::{DispatcherStats, EventPublisher};
pub use stream::EventStream;
