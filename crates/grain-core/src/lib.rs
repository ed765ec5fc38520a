//! Shared vocabulary for the grain fan-out server: branded ids and the
//! [`envelope::Envelope`] record that travels over the bus and into history.

pub mod envelope;
pub mod ids;

pub use envelope::{Envelope, EnvelopeError};
pub use ids::{ConnectionId, HubId};
