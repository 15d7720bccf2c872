//! Best-effort block cloning. Cloning is an optimisation only; every
//! caller must be prepared for `false` and fall back to a byte copy.

use log::*;
use tokio::fs::File;

pub const DEFAULT_BLOCKSIZE: u64 = 4096;

/// Preferred I/O blocksize of an open file, 4096 when unknown.
pub async fn blocksize_of(file: &File) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = file.metadata().await {
            if meta.blksize() > 0 {
                return meta.blksize();
            }
        }
    }
    #[cfg(not(unix))]
    let _ = file;
    DEFAULT_BLOCKSIZE
}

#[cfg(target_os = "linux")]
mod ficlone {
    #[repr(C)]
    pub struct FileCloneRange {
        pub src_fd: i64,
        pub src_offset: u64,
        pub src_length: u64,
        pub dest_offset: u64,
    }
    nix::ioctl_write_ptr!(ficlonerange, 0x94, 13, FileCloneRange);
}

/// Share `length` bytes of physical blocks from `src` into `dst`.
///
/// Offsets and length must be blocksize aligned. Returns `false` when the
/// platform or the filesystem cannot clone the range; any pending writes on
/// `dst` must have been flushed before calling.
pub fn clone_file_range(
    src: &File,
    src_offset: u64,
    dst: &File,
    dst_offset: u64,
    length: u64,
) -> bool {
    if length == 0 {
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let range = ficlone::FileCloneRange {
            src_fd: src.as_raw_fd() as i64,
            src_offset,
            src_length: length,
            dest_offset: dst_offset,
        };
        match unsafe { ficlone::ficlonerange(dst.as_raw_fd(), &range) } {
            Ok(_) => true,
            Err(err) => {
                debug!(
                    "block clone of {} bytes at {} not used: {}",
                    length, dst_offset, err
                );
                false
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (src, src_offset, dst, dst_offset);
        false
    }
}
