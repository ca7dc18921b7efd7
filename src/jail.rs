//! Chroot jail for local fallback shells.
//!
//! The jail root is a tmpfs with the host's system directories bind-mounted
//! read-only, a handful of device nodes, `/proc`, and a writable `/home`
//! owned by `nobody`. Preparing and removing it needs root; entering it
//! happens in the forked child right before exec.

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::resource::{setrlimit, Resource};
use std::ffi::CString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const NOBODY_UID: u32 = 65534;
pub const NOBODY_GID: u32 = 65534;

const BIND_DIRS: [&str; 5] = ["/bin", "/lib", "/lib64", "/usr", "/etc"];
const DEVICES: [&str; 4] = ["null", "zero", "urandom", "random"];

/// Resource limits applied to the jailed shell and everything it spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JailLimits {
    pub cpu_secs: u64,
    pub mem_kb: u64,
    pub fsize_kb: u64,
    pub nofile: u64,
    pub nproc: u64,
}

impl Default for JailLimits {
    fn default() -> Self {
        Self {
            cpu_secs: 600,
            mem_kb: 524_288,
            fsize_kb: 10_240,
            nofile: 256,
            nproc: 64,
        }
    }
}

/// Whether this process can build jails at all.
pub fn supported() -> bool {
    nix::unistd::geteuid().is_root()
}

fn fail(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Spawn(format!("jail {what}: {e}"))
}

/// Builds a jail at `root`, writing `home_files` into its `/home`.
pub fn prepare(root: &Path, home_files: &[(&str, String)]) -> Result<()> {
    if root.exists() {
        cleanup(root);
    }
    fs::create_dir_all(root).map_err(|e| fail("mkdir", e))?;

    mount(
        Some("tmpfs"),
        root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("size=256M,mode=755"),
    )
    .map_err(|e| fail("mount tmpfs", e))?;

    for dir in &BIND_DIRS {
        let target = root.join(&dir[1..]);
        if !Path::new(dir).exists() {
            continue;
        }
        fs::create_dir_all(&target).map_err(|e| fail(&format!("mkdir {dir}"), e))?;
        mount(
            Some(*dir),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| fail(&format!("bind {dir}"), e))?;
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| fail(&format!("remount ro {dir}"), e))?;
    }

    let tmp_dir = root.join("tmp");
    fs::create_dir_all(&tmp_dir).map_err(|e| fail("mkdir tmp", e))?;
    fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o1777)).map_err(|e| fail("chmod tmp", e))?;

    let dev_dir = root.join("dev");
    fs::create_dir_all(&dev_dir).map_err(|e| fail("mkdir dev", e))?;
    for dev in &DEVICES {
        let host_dev = format!("/dev/{dev}");
        if !Path::new(&host_dev).exists() {
            continue;
        }
        let jail_dev = dev_dir.join(dev);
        fs::write(&jail_dev, "").map_err(|e| fail(&format!("touch {dev}"), e))?;
        mount(
            Some(host_dev.as_str()),
            &jail_dev,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| fail(&format!("bind {dev}"), e))?;
    }

    let proc_dir = root.join("proc");
    fs::create_dir_all(&proc_dir).map_err(|e| fail("mkdir proc", e))?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| fail("mount proc", e))?;

    let home_dir = root.join("home");
    fs::create_dir_all(&home_dir).map_err(|e| fail("mkdir home", e))?;
    for (name, content) in home_files {
        let path = home_dir.join(name);
        fs::write(&path, content).map_err(|e| fail(&format!("write {name}"), e))?;
        std::os::unix::fs::chown(&path, Some(NOBODY_UID), Some(NOBODY_GID)).map_err(|e| fail("chown", e))?;
    }
    fs::set_permissions(&home_dir, fs::Permissions::from_mode(0o755)).map_err(|e| fail("chmod home", e))?;
    std::os::unix::fs::chown(&home_dir, Some(NOBODY_UID), Some(NOBODY_GID)).map_err(|e| fail("chown home", e))?;

    info!(root = %root.display(), "jail prepared");
    Ok(())
}

/// Moves the calling (forked, pre-exec) process into the jail.
///
/// Only thin syscall wrappers run here.
pub fn enter(root: &CString, workdir: &CString, limits: &JailLimits) -> std::io::Result<()> {
    unsafe {
        if libc::chroot(root.as_ptr()) != 0 || libc::chdir(workdir.as_ptr()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    set_limits(limits)?;
    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0
            || libc::setgid(NOBODY_GID) != 0
            || libc::setuid(NOBODY_UID) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_limits(limits: &JailLimits) -> std::io::Result<()> {
    let mem_bytes = limits.mem_kb * 1024;
    let fsize_bytes = limits.fsize_kb * 1024;
    let all = [
        (Resource::RLIMIT_CPU, limits.cpu_secs),
        (Resource::RLIMIT_AS, mem_bytes),
        (Resource::RLIMIT_FSIZE, fsize_bytes),
        (Resource::RLIMIT_NOFILE, limits.nofile),
        (Resource::RLIMIT_CORE, 0),
        (Resource::RLIMIT_NPROC, limits.nproc),
    ];
    for (resource, value) in all {
        setrlimit(resource, value, value).map_err(std::io::Error::from)?;
    }
    Ok(())
}

/// Unmounts and removes a jail. Best effort.
pub fn cleanup(root: &Path) {
    let dev_dir = root.join("dev");
    for dev in &DEVICES {
        let path = dev_dir.join(dev);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    for mp in ["proc", "etc", "usr", "lib64", "lib", "bin"] {
        let path = root.join(mp);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    let _ = umount2(root, MntFlags::MNT_DETACH);
    let _ = fs::remove_dir_all(root);
    debug!(root = %root.display(), "jail removed");
}
