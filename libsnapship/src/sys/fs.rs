//! Mount table and free-space queries for local endpoints. Remote
//! endpoints answer the same questions with commands over their transport.

use anyhow::{anyhow, Result};
use mnt::{MountEntry, MountIter};
use std::path::Path;

pub use double::*;

#[cfg_attr(test, mockall::automock)]
pub mod double {
    use super::*;

    /// The mount entry whose mount point is exactly target, if target is
    /// itself a mount point. Unparseable /proc entries are skipped.
    pub fn mountentry_at(target: &Path) -> Option<MountEntry> {
        let iter = match MountIter::new_from_proc() {
            Ok(iter) => iter,
            Err(_) => return None,
        };
        iter.filter_map(|m| m.ok()).find(|m| m.file == target)
    }

    /// The mount holding target: target itself or the nearest mount above
    /// it.
    pub fn mountentry_containing(target: &Path) -> Option<MountEntry> {
        mnt::get_mount(target).ok().flatten()
    }

    /// Bytes available to unprivileged users on the filesystem holding
    /// target.
    pub fn filesystem_free_bytes(target: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(target)
            .map_err(|e| anyhow!("statvfs failed for {:?}: {}", target, e))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

/// Whether a mount can receive native replication streams.
pub fn receives_native_streams(entry: &MountEntry) -> bool {
    entry.vfstype == "btrfs"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btrfs_mounts_receive_native_streams() {
        let entry: MountEntry = "/dev/sdb /mnt/backup btrfs rw,noatime 0 0".parse().unwrap();
        assert!(receives_native_streams(&entry));
    }

    #[test]
    fn other_filesystems_do_not() {
        for line in &[
            "/dev/sda2 / ext4 rw 0 0",
            "/dev/sdc1 /mnt/usb vfat rw 0 0",
            "tmpfs /tmp tmpfs rw 0 0",
        ] {
            let entry: MountEntry = line.parse().unwrap();
            assert!(!receives_native_streams(&entry), "{} accepted", line);
        }
    }
}
