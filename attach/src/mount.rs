use crate::{Error, Result};
use std::path::Path;

/// Pins a container's network namespace at a stable path.
pub trait Mounter: Send + Sync {
    /// Bind-mounts `source` at `target`, returning false without change if
    /// `target` is already a mount point.
    fn mount(&self, source: &Path, target: &Path) -> Result<bool>;

    /// Detaches and removes `target`. Succeeds if it is already gone.
    fn unmount(&self, target: &Path) -> Result<()>;

    fn is_mounted(&self, target: &Path) -> Result<bool>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct BindMounter(());

impl<T: Mounter + ?Sized> Mounter for std::sync::Arc<T> {
    fn mount(&self, source: &Path, target: &Path) -> Result<bool> {
        (**self).mount(source, target)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        (**self).unmount(target)
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        (**self).is_mounted(target)
    }
}

/// Indicates whether `/proc/self/mountinfo` content lists a mount at `target`.
fn listed(mountinfo: &str, target: &Path) -> bool {
    let target = target.to_string_lossy();
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .any(|point| unescape(point) == target)
}

/// Decodes the octal escapes the kernel applies to whitespace and
/// backslashes in mount points.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(i) = rest.find('\\') {
        out.push_str(&rest[..i]);
        let code = rest.get(i + 1..i + 4);
        match code.and_then(|c| u8::from_str_radix(c, 8).ok()) {
            Some(b) => {
                out.push(char::from(b));
                rest = &rest[i + 4..];
            }
            None => {
                out.push('\\');
                rest = &rest[i + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

// === impl BindMounter ===

impl BindMounter {
    pub fn new() -> Self {
        Self(())
    }
}

#[cfg(target_os = "linux")]
impl Mounter for BindMounter {
    fn mount(&self, source: &Path, target: &Path) -> Result<bool> {
        if self.is_mounted(target)? {
            tracing::debug!(target = %target.display(), "Already mounted");
            return Ok(false);
        }
        let failed = |source: std::io::Error| Error::Mount {
            path: target.to_path_buf(),
            source,
        };
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir).map_err(failed)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(target)
            .map_err(failed)?;
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            nix::mount::MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| failed(e.into()))?;
        Ok(true)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let failed = |source: std::io::Error| Error::Mount {
            path: target.to_path_buf(),
            source,
        };
        if self.is_mounted(target)? {
            nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH)
                .map_err(|e| failed(e.into()))?;
        }
        match std::fs::remove_file(target) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(failed(e)),
            _ => Ok(()),
        }
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        Ok(listed(&mountinfo, target))
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for BindMounter {
    fn mount(&self, _: &Path, target: &Path) -> Result<bool> {
        Err(unsupported(target))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Err(unsupported(target))
    }

    fn is_mounted(&self, _: &Path) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported(target: &Path) -> Error {
    Error::Mount {
        path: target.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "bind mounts require linux",
        ),
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::{collections::BTreeMap, path::PathBuf};

    /// Tracks mounts in memory.
    #[derive(Debug, Default)]
    pub struct FakeMounter {
        mounts: Mutex<BTreeMap<PathBuf, PathBuf>>,
        fail: Mutex<bool>,
    }

    impl FakeMounter {
        pub fn mounts(&self) -> BTreeMap<PathBuf, PathBuf> {
            self.mounts.lock().clone()
        }

        /// Makes every subsequent operation fail.
        pub fn fail(&self, fail: bool) {
            *self.fail.lock() = fail;
        }

        fn check(&self, target: &Path) -> Result<()> {
            if *self.fail.lock() {
                return Err(Error::Mount {
                    path: target.to_path_buf(),
                    source: std::io::Error::other("injected failure"),
                });
            }
            Ok(())
        }
    }

    impl Mounter for FakeMounter {
        fn mount(&self, source: &Path, target: &Path) -> Result<bool> {
            self.check(target)?;
            let mut mounts = self.mounts.lock();
            if mounts.contains_key(target) {
                return Ok(false);
            }
            mounts.insert(target.to_path_buf(), source.to_path_buf());
            Ok(true)
        }

        fn unmount(&self, target: &Path) -> Result<()> {
            self.check(target)?;
            self.mounts.lock().remove(target);
            Ok(())
        }

        fn is_mounted(&self, target: &Path) -> Result<bool> {
            Ok(self.mounts.lock().contains_key(target))
        }
    }
}
