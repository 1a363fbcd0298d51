//! Target registry
//!
//! Opens storage targets read-only, optionally with `O_DIRECT`, and records
//! their geometry. Block devices are sized with the `BLKGETSIZE64` ioctl,
//! regular files from their metadata. The registry is filled once at startup
//! and only read during a run.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::libc;
use rand::Rng;
use tracing::{debug, info};

use crate::config::MAX_TARGETS;
use crate::error::{Error, Result};

/// Dense index of a registered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(usize);

impl TargetId {
    /// Wrap a registry index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Registry index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// What kind of endpoint a target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Raw block device
    BlockDevice,
    /// Regular file
    File,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockDevice => write!(f, "block device"),
            Self::File => write!(f, "file"),
        }
    }
}

/// An opened storage endpoint and its geometry.
#[derive(Debug)]
pub struct Target {
    id: TargetId,
    path: PathBuf,
    file: Option<File>,
    total_size: u64,
    block_size: usize,
    kind: TargetKind,
}

impl Target {
    /// Registry index.
    #[must_use]
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// Path the target was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Read size and offset alignment in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Block device or regular file.
    #[must_use]
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Descriptor, if the target is open (`None` once closed or when detached).
    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Number of aligned offsets a full-block read can start at.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.total_size / self.block_size as u64
    }
}

/// Set of opened targets.
#[derive(Debug)]
pub struct TargetRegistry {
    targets: Vec<Target>,
    direct: bool,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetRegistry {
    /// Empty registry opening targets with `O_DIRECT`.
    #[must_use]
    pub fn new() -> Self {
        Self { targets: Vec::new(), direct: true }
    }

    /// Toggle `O_DIRECT` for subsequent registrations.
    #[must_use]
    pub fn direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    /// Open `path` read-only and record its geometry.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] when the registry is full
    /// - [`Error::Open`] when the path cannot be opened or inspected
    /// - [`Error::Geometry`] when the size is unknown or smaller than one block
    pub fn register<P: AsRef<Path>>(&mut self, path: P, block_size: usize) -> Result<TargetId> {
        self.check_capacity()?;
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true);
        if self.direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options
            .open(&path)
            .map_err(|source| Error::Open { path: path.clone(), source })?;

        let metadata =
            file.metadata().map_err(|source| Error::Open { path: path.clone(), source })?;
        let file_type = metadata.file_type();

        let (kind, total_size) = if file_type.is_block_device() {
            (TargetKind::BlockDevice, device_size(&file, &path)?)
        } else if file_type.is_file() {
            (TargetKind::File, metadata.len())
        } else {
            return Err(Error::Geometry {
                path,
                reason: "not a block device or regular file".into(),
            });
        };

        check_geometry(&path, total_size, block_size)?;

        let id = TargetId(self.targets.len());
        info!(
            path = %path.display(),
            %kind,
            total_size,
            block_size,
            direct = self.direct,
            "registered target"
        );
        self.targets.push(Target { id, path, file: Some(file), total_size, block_size, kind });
        Ok(id)
    }

    /// Register a target from known geometry without opening anything.
    ///
    /// Detached targets have no descriptor; they can only be driven by a
    /// backend that never touches the kernel.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] when full, [`Error::Geometry`] for bad sizes.
    pub fn register_detached<P: AsRef<Path>>(
        &mut self,
        path: P,
        total_size: u64,
        block_size: usize,
    ) -> Result<TargetId> {
        self.check_capacity()?;
        let path = path.as_ref().to_path_buf();
        check_geometry(&path, total_size, block_size)?;

        let id = TargetId(self.targets.len());
        debug!(path = %path.display(), total_size, block_size, "registered detached target");
        self.targets.push(Target {
            id,
            path,
            file: None,
            total_size,
            block_size,
            kind: TargetKind::File,
        });
        Ok(id)
    }

    /// Release every descriptor. Safe to call more than once.
    pub fn close_all(&mut self) {
        let mut closed = 0usize;
        for target in &mut self.targets {
            if target.file.take().is_some() {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "closed target descriptors");
        }
    }

    /// Look up a target.
    #[must_use]
    pub fn get(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(id.0)
    }

    /// Number of registered targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Iterate over registered targets.
    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    /// Pick a target uniformly at random.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Target> {
        if self.targets.is_empty() {
            return None;
        }
        let index = rng.random_range(0..self.targets.len());
        self.targets.get(index)
    }

    fn check_capacity(&self) -> Result<()> {
        if self.targets.len() >= MAX_TARGETS {
            return Err(Error::InvalidConfig(format!(
                "at most {MAX_TARGETS} targets can be registered"
            )));
        }
        Ok(())
    }
}

fn check_geometry(path: &Path, total_size: u64, block_size: usize) -> Result<()> {
    if block_size == 0 {
        return Err(Error::Geometry {
            path: path.to_path_buf(),
            reason: "block size is zero".into(),
        });
    }
    if total_size < block_size as u64 {
        return Err(Error::Geometry {
            path: path.to_path_buf(),
            reason: format!("block size {block_size} exceeds size {total_size}"),
        });
    }
    Ok(())
}

/// Device size via `ioctl(BLKGETSIZE64)`.
fn device_size(file: &File, path: &Path) -> Result<u64> {
    // BLKGETSIZE64 = _IOR(0x12, 114, u64)
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    // SAFETY: fd is open for the duration of the call; size is a valid u64 out-param.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
    if ret < 0 {
        return Err(Error::Geometry {
            path: path.to_path_buf(),
            reason: format!("BLKGETSIZE64 failed: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(size)
}
