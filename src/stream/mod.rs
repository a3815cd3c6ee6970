// Public module exports
pub mod decoder;
pub mod events;
pub mod patch;
pub mod reconciler;
pub mod source;

// Re-export main types for convenience
pub use decoder::{decode_envelopes, LineDecoder};
pub use events::Envelope;
pub use patch::{Diff, Patch, PatchError, PathSegment};
pub use reconciler::{
    ReconcileStats, ReconcilerEvent, StreamReconciler, StreamState, Submission, SubscriptionId,
};
pub use source::DeltaSource;
