//! Common re-exports for consumers of this crate.

pub use crate::cbt::CbtMap;
pub use crate::config::Config;
pub use crate::diff_area::DiffArea;
pub use crate::error::{Error, KResult};
pub use crate::event_queue::{Event, EventRecord};
pub use crate::image::SnapshotImage;
pub use crate::io_engine::{BlockBackend, MemBackend};
pub use crate::registry::{Command, Registry, Response, TrackedDeviceInfo};
pub use crate::snapshot::{FreezeControl, NullFreeze, Snapshot};
pub use crate::storage::DiffStorage;
pub use crate::tracker::{FilterOutcome, Tracker};
pub use crate::types::{DeviceId, Extent, PAGE_SIZE, SECTOR_SIZE};
