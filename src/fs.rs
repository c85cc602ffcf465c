/*
 * Copyright (C) 2023-2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs::{self, File};
use std::io;
use std::ops::Deref;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::ptr;
use std::slice;

// S_IROTH
const OTHER_READABLE: u32 = 0o004;

#[derive(Debug, PartialEq, Eq)]
pub enum Resource {
    Missing,
    Forbidden,
    Directory,
    File { size: usize },
}

/// Classifies a path the way it will be served.
pub fn inspect(path: &Path) -> Resource {
    let md = match fs::metadata(path) {
        Ok(md) => md,
        Err(_) => return Resource::Missing,
    };

    if md.permissions().mode() & OTHER_READABLE == 0 {
        return Resource::Forbidden;
    }

    if md.is_dir() {
        return Resource::Directory;
    }

    Resource::File {
        size: md.len() as usize,
    }
}

/// Read-only private mapping of a whole file. Unmapped on drop.
pub struct FileMap {
    ptr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the mapping is read-only and private, and owned by exactly one
// FileMap, so moving it between threads is sound
unsafe impl Send for FileMap {}

impl FileMap {
    pub fn open(path: &Path) -> Result<Self, io::Error> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;

        // zero-length mappings are rejected by the kernel
        if len == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        // SAFETY: fd is valid for the duration of the call. the mapping
        // outlives the fd, which is allowed
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }
}

impl Deref for FileMap {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr points to len readable bytes until drop
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        // SAFETY: ptr and len came from a successful mmap
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}
