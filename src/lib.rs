// Базовые модули
pub mod consts;
pub mod error;
pub mod config;
pub mod metrics;

// Экстенты файлов (FIEMAP на Linux, статические карты и сканирование для тестов)
pub mod extent;
#[cfg(target_os = "linux")]
pub mod fiemap;

// Цепочка снапшотов + хуки контроллера
pub mod snapshots;

// COW exception store: layout, chunk index, builder, reader
pub mod cow;

// Откат устройства через diff-образ
pub mod restore;

pub mod cli;

// Удобные реэкспорты
pub use config::{ChunkSearch, RangeBounds, RevertConfig};
pub use cow::{export, CowExport, CowImage, ExceptionStoreBuilder, ExportReport};
pub use error::RevertError;
pub use extent::{
    platform_extent_source, DataScanExtentSource, Extent, ExtentSource, RangeSet, StaticExtentSource,
};
pub use restore::{RestoreEngine, RestoreReport};
pub use snapshots::{
    discover, CommandHooks, DeviceControl, NoopController, SnapshotController, SnapshotIndex,
    SnapshotVersion,
};
