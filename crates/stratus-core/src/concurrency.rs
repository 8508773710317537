use crate::InstallerError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use stratus_store::DataLayout;
use tracing::{debug, warn};

/// Keeps a second installer process off a file-backed data dir for as long
/// as the owning installer lives.
#[derive(Debug)]
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Take the data dir's lock without blocking. Contention and I/O
    /// failures both surface as [`InstallerError::Open`] for the data dir.
    pub fn try_acquire(layout: &DataLayout) -> Result<Self, InstallerError> {
        let open_error = |reason: String| InstallerError::Open {
            path: layout.root().display().to_string(),
            reason,
        };
        let path = layout.lock_file();
        fs::create_dir_all(layout.db_dir()).map_err(|e| open_error(e.to_string()))?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| open_error(format!("cannot open {}: {e}", path.display())))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("locked {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(open_error(
                "data dir is in use by another installer".to_owned(),
            )),
            Err(e) => Err(open_error(format!("cannot lock {}: {e}", path.display()))),
        }
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("cannot unlock {}: {e}", self.path.display());
        }
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks long-running drivers to wind down; a second one exits.
pub fn install_signal_handler() {
    let installed = ctrlc::set_handler(|| {
        if SHUTDOWN.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\ninterrupted; finishing in-flight clusters (Ctrl-C again to abort)");
    });
    if let Err(e) = installed {
        warn!("cannot install Ctrl-C handler: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
