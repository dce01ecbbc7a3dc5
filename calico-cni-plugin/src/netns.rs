use std::fs::File;
use std::os::fd::AsFd;
use std::path::Path;
use std::thread;

use nix::sched::{setns, CloneFlags};

use crate::{Error, Result};

/// Saves the calling thread's network namespace and restores it on drop.
struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    fn enter(path: &Path) -> Result<Self> {
        let original = File::open("/proc/self/ns/net")
            .map_err(|e| Error::Netns(format!("failed to open current namespace: {e}")))?;
        let target = File::open(path).map_err(|e| {
            Error::Netns(format!("failed to open namespace {}: {e}", path.display()))
        })?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::Netns(format!("failed to enter {}: {e}", path.display())))?;
        Ok(Self { original })
    }

    fn restore(self) -> Result<()> {
        setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::Netns(format!("failed to restore original namespace: {e}")))?;
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        // Best effort; the thread is discarded after this anyway.
        let _ = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET);
    }
}

/// Run `f` with the network namespace at `path` active.
///
/// `setns(2)` switches a single OS thread, so the closure runs on a
/// dedicated thread pinned to the target namespace; the thread re-enters its
/// original namespace before it is joined, whatever `f` does.
pub fn with_netns<T, F>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    thread::scope(|scope| {
        scope
            .spawn(move || -> Result<T> {
                let guard = NetnsGuard::enter(path)?;
                let out = f();
                guard.restore()?;
                out
            })
            .join()
            .map_err(|_| Error::Netns("namespace worker thread panicked".into()))?
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_namespace_is_openable() {
        assert!(File::open("/proc/self/ns/net").is_ok());
    }

    #[test]
    fn missing_namespace_path_is_an_error() {
        let err = with_netns(Path::new("/nonexistent/ns/net"), || Ok(())).unwrap_err();
        assert!(matches!(err, Error::Netns(_)));
    }
}
