// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: A/B slot model and boot-slot detection
//! OWNERS: @runtime
//!
//! The active slot is derived once at startup from the partition the device
//! booted from. GPT layout: KERN-A=2, ROOT-A=3, KERN-B=4, ROOT-B=5.

use std::fs;
use std::path::PathBuf;

use crate::error::{DlcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Directory name used for per-slot images and prefs; also the slot name
    /// passed to image-loader.
    pub const fn name(self) -> &'static str {
        match self {
            Slot::A => "Dlc-A",
            Slot::B => "Dlc-B",
        }
    }

    pub const ALL: [Slot; 2] = [Slot::A, Slot::B];
}

/// Source of boot-device facts. Implemented over sysfs for the daemon and by
/// fakes in tests.
pub trait BootDevice {
    /// Returns the partition the device booted from (e.g. `/dev/sda3`).
    fn boot_device(&self) -> Option<String>;

    /// Returns true when `device` is a removable disk (USB stick, SD card).
    fn is_removable_device(&self, device: &str) -> bool;
}

/// Boot facts resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSlot {
    active: Slot,
    removable: bool,
}

impl BootSlot {
    pub fn new(active: Slot, removable: bool) -> Self {
        Self { active, removable }
    }

    /// Resolves the active slot from `device`.
    pub fn detect(device: &dyn BootDevice) -> Result<Self> {
        let boot = device
            .boot_device()
            .ok_or_else(|| DlcError::internal("unable to determine the boot device"))?;
        let (disk, partition) = split_partition(&boot)
            .ok_or_else(|| DlcError::internal(format!("malformed boot device {boot}")))?;
        let active = match partition {
            2 | 3 => Slot::A,
            4 | 5 => Slot::B,
            other => {
                return Err(DlcError::internal(format!(
                    "boot partition {other} of {boot} is not an A/B root"
                )))
            }
        };
        Ok(Self { active, removable: device.is_removable_device(&disk) })
    }

    pub fn active(&self) -> Slot {
        self.active
    }

    pub fn inactive(&self) -> Slot {
        self.active.other()
    }

    pub fn is_removable(&self) -> bool {
        self.removable
    }
}

/// Splits `/dev/sda3` into (`/dev/sda`, 3) and `/dev/mmcblk0p5` into
/// (`/dev/mmcblk0`, 5).
fn split_partition(device: &str) -> Option<(String, u32)> {
    let digits_at = device.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits_at == device.len() {
        return None;
    }
    let partition = device[digits_at..].parse().ok()?;
    let mut disk = &device[..digits_at];
    if let Some(stripped) = disk.strip_suffix('p') {
        if stripped.ends_with(|c: char| c.is_ascii_digit()) {
            disk = stripped;
        }
    }
    if disk.is_empty() {
        return None;
    }
    Some((disk.to_string(), partition))
}

/// [`BootDevice`] backed by `/proc/cmdline` and `/sys/block`.
pub struct SysfsBootDevice {
    cmdline: PathBuf,
    sys_block: PathBuf,
}

impl SysfsBootDevice {
    pub fn new() -> Self {
        Self { cmdline: PathBuf::from("/proc/cmdline"), sys_block: PathBuf::from("/sys/block") }
    }

    pub fn with_roots(cmdline: PathBuf, sys_block: PathBuf) -> Self {
        Self { cmdline, sys_block }
    }
}

impl Default for SysfsBootDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl BootDevice for SysfsBootDevice {
    fn boot_device(&self) -> Option<String> {
        let cmdline = fs::read_to_string(&self.cmdline).ok()?;
        cmdline
            .split_whitespace()
            .find_map(|arg| arg.strip_prefix("root="))
            .filter(|root| root.starts_with("/dev/"))
            .map(str::to_string)
    }

    fn is_removable_device(&self, device: &str) -> bool {
        let name = device.rsplit('/').next().unwrap_or(device);
        fs::read_to_string(self.sys_block.join(name).join("removable"))
            .map(|value| value.trim() == "1")
            .unwrap_or(false)
    }
}
