use std::io;
use std::path::Path;

/// Reports the capacity of the filesystem holding a directory.
///
/// Implementations may block; callers run them on the blocking pool.
pub trait SpaceGauge: Send + Sync + std::fmt::Debug + 'static {
    /// Bytes available to unprivileged writers
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;

    fn total_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Gauge backed by `statvfs`/`GetDiskFreeSpaceEx`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceGauge;

impl SpaceGauge for FsSpaceGauge {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }

    fn total_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::total_space(path)
    }
}
