// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

bitflags! {
    /// The memory access permissions of a mapping, also used to describe the
    /// access that triggered a fault.
    pub struct VmPerms: u32 {
        /// Readable.
        const READ    = 1 << 0;
        /// Writable.
        const WRITE   = 1 << 1;
        /// Executable.
        const EXEC    = 1 << 2;
    }
}

impl VmPerms {
    /// Returns whether the permission set admits the given access.
    pub fn admits(&self, access: VmPerms) -> bool {
        self.contains(access)
    }
}
