pub mod delivery;
pub mod error;
pub mod init;
pub mod models;
pub mod relay;
pub mod render;
pub mod stream;
pub mod tasks;

pub use crate::delivery::{DeliveryBatcher, DeliveryTarget, HttpSurface, LiveMessageSurface};
pub use crate::error::{ErrorCode, RelayError, Result};
pub use crate::models::{ActionElement, Block, ContentPart, DocumentTree, ResponseMetadata};
pub use crate::relay::{relay_stream, RelayOutcome, RelaySettings};
pub use crate::render::{render, render_open, render_wire};
pub use crate::stream::{DeltaSource, StreamReconciler, StreamState};
pub use crate::tasks::{extract, TaskInfo, TaskTrackers};
