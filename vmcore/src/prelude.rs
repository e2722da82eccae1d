// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

pub(crate) use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::fmt::Debug;

pub(crate) use bitflags::bitflags;
pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::{
    error::{Errno, Error},
    return_errno, return_errno_with_message,
    sync::{SpinLock, SpinLockGuard, WaitQueue},
    Vaddr, PAGE_SIZE,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;
