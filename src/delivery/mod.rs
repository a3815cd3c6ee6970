// Public module exports
pub mod batcher;
pub mod surface;

pub use batcher::{
    DebounceTimer, DeliveryBatcher, DeliveryReport, DeliveryStats, DeliveryTarget, LiveMessage,
    TextCursor, DEFAULT_DEBOUNCE, ERROR_NOTICE,
};
pub use surface::{HttpSurface, LiveMessageSurface, SurfaceConfig};
