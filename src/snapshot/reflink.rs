//! Copy-on-write file cloning.
//!
//! OCFS2 exposes its own path-based REFLINK ioctl; btrfs and XFS use
//! FICLONE on an open destination. Both produce a new file sharing
//! physical blocks with the source until either side is written.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::statfs::statfs;

use crate::error::{ExporterError, ExporterResult};

/// OCFS2 REFLINK ioctl request, from ocfs2_fs.h.
const OCFS2_IOC_REFLINK: libc::c_ulong = 1075343108;

/// FICLONE ioctl request, from linux/fs.h.
const FICLONE: libc::c_ulong = 0x4004_9409;

/// OCFS2 superblock magic.
const OCFS2_SUPER_MAGIC: i64 = 0x7461636f;

#[repr(C)]
struct ReflinkArgs {
    old_path: u64,
    new_path: u64,
    preserve: u64,
}

/// Filesystems known to redirect modified shared blocks to new physical
/// locations, the property the differencer depends on.
pub fn filesystem_supports_reflink(filesystem: &str) -> bool {
    matches!(filesystem, "ocfs2" | "btrfs" | "xfs")
}

/// Creates a copy-on-write clone of `src` at `dst`.
///
/// The destination must not exist. After success, reading `dst` returns
/// the bytes of `src` at call time and writes to either file no longer
/// affect the other.
pub fn reflink(src: &Path, dst: &Path) -> ExporterResult<()> {
    if dst.exists() {
        return Err(ExporterError::io(
            format!("creating reflink {}", dst.display()),
            std::io::Error::from(std::io::ErrorKind::AlreadyExists),
        ));
    }

    let fs_type = statfs(src)
        .map_err(|e| ExporterError::io(format!("statfs {}", src.display()), e.into()))?
        .filesystem_type();

    if fs_type.0 as i64 == OCFS2_SUPER_MAGIC {
        ocfs2_reflink(src, dst)
    } else {
        ficlone(src, dst)
    }
}

/// Creates a reflinked copy on OCFS2 via the filesystem's own ioctl,
/// which takes both paths and performs the clone atomically.
fn ocfs2_reflink(src: &Path, dst: &Path) -> ExporterResult<()> {
    let old_path = CString::new(src.as_os_str().as_bytes())
        .map_err(|e| ExporterError::io("encoding source path", e.into()))?;
    let new_path = CString::new(dst.as_os_str().as_bytes())
        .map_err(|e| ExporterError::io("encoding destination path", e.into()))?;

    let args = ReflinkArgs {
        old_path: old_path.as_ptr() as u64,
        new_path: new_path.as_ptr() as u64,
        preserve: 1,
    };

    let file = File::open(src)
        .map_err(|e| ExporterError::io(format!("opening {}", src.display()), e))?;

    let ret = unsafe { libc::ioctl(file.as_raw_fd(), OCFS2_IOC_REFLINK, &args) };
    if ret != 0 {
        return Err(reflink_errno(src, Errno::last()));
    }
    Ok(())
}

/// Clones via FICLONE, used on btrfs and XFS.
fn ficlone(src: &Path, dst: &Path) -> ExporterResult<()> {
    let src_file = File::open(src)
        .map_err(|e| ExporterError::io(format!("opening {}", src.display()), e))?;
    let dst_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(|e| ExporterError::io(format!("creating {}", dst.display()), e))?;

    let ret = unsafe {
        libc::ioctl(
            dst_file.as_raw_fd(),
            FICLONE,
            src_file.as_raw_fd() as libc::c_int,
        )
    };
    if ret != 0 {
        let errno = Errno::last();
        drop(dst_file);
        let _ = std::fs::remove_file(dst);
        return Err(reflink_errno(src, errno));
    }
    Ok(())
}

fn reflink_errno(src: &Path, errno: Errno) -> ExporterError {
    match errno {
        Errno::EOPNOTSUPP | Errno::ENOTTY | Errno::EINVAL => ExporterError::NotCloneable(
            src.display().to_string(),
        ),
        _ => ExporterError::io(
            format!("running reflink ioctl on {}", src.display()),
            std::io::Error::from(errno),
        ),
    }
}
