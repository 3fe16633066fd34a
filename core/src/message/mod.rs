// Message module — domain messages and version-tagged wire envelopes

pub mod envelope;
pub mod types;

pub use envelope::{EnvelopeError, EnvelopeV1, EnvelopeV2, EnvelopeV3, VersionedEnvelope};
pub use types::{AppIdentity, Content, DomainMessage};
