//! Extent map extraction via the FIEMAP ioctl.

use std::fs::File;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;

use crate::error::{ExporterError, ExporterResult};
use crate::models::Chunk;

/// Number of extents requested per FIEMAP call. Chunking bounds the
/// kernel buffer; each page restarts at the end of the last extent.
const EXTENT_BATCH: u32 = 8000;

/// FS_IOC_FIEMAP ioctl request.
const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;

/// Sync the file before mapping.
const FIEMAP_FLAG_SYNC: u32 = 0x0001;

const FIEMAP_MAX_OFFSET: u64 = u64::MAX;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FiemapHeader {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

/// Returns a list of extents allocated to the file.
///
/// A thinly provisioned file with no written blocks maps to an empty list;
/// that is success, not failure.
pub fn get_extents(path: &Path) -> ExporterResult<Vec<Chunk>> {
    let file = File::open(path)
        .map_err(|e| ExporterError::io(format!("opening {}", path.display()), e))?;

    let mut ret: Vec<Chunk> = Vec::new();
    loop {
        let start = ret.last().map(|c| c.start + c.length).unwrap_or(0);
        let page = fiemap_page(file.as_raw_fd(), start)
            .map_err(|e| ExporterError::io(format!("fetching fiemap of {}", path.display()), e))?;
        if page.is_empty() {
            break;
        }
        ret.extend(page.iter().map(|extent| Chunk {
            start: extent.fe_logical,
            length: extent.fe_length,
            physical: extent.fe_physical,
        }));
    }
    Ok(ret)
}

/// Fetches one page of up to `EXTENT_BATCH` extents starting at `start`.
fn fiemap_page(fd: RawFd, start: u64) -> std::io::Result<Vec<FiemapExtent>> {
    let header_size = mem::size_of::<FiemapHeader>();
    let extent_size = mem::size_of::<FiemapExtent>();
    // The fiemap argument is a header immediately followed by the extent
    // array the kernel fills in. Backed by u64s to satisfy the 8-byte
    // alignment of both structs.
    let words = (header_size + EXTENT_BATCH as usize * extent_size).div_ceil(8);
    let mut buf = vec![0u64; words];

    let header = buf.as_mut_ptr() as *mut FiemapHeader;
    unsafe {
        (*header).fm_start = start;
        (*header).fm_length = FIEMAP_MAX_OFFSET;
        (*header).fm_flags = FIEMAP_FLAG_SYNC;
        (*header).fm_extent_count = EXTENT_BATCH;

        if libc::ioctl(fd, FS_IOC_FIEMAP, buf.as_mut_ptr()) != 0 {
            return Err(std::io::Error::from(Errno::last()));
        }

        let mapped = (*header).fm_mapped_extents as usize;
        let extents = (buf.as_ptr() as *const u8).add(header_size) as *const FiemapExtent;
        Ok(std::slice::from_raw_parts(extents, mapped).to_vec())
    }
}
