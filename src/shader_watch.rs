// Shader hot reload - watch the kernel source for edits
//
// The kernel compiles at runtime, so a saved edit only needs a pipeline
// rebuild. The watcher feeds a channel drained once per frame; the
// renderer applies the reload at the next inter-frame boundary.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, TryRecvError};

pub struct ShaderWatcher {
    _watcher: notify::RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
}

impl ShaderWatcher {
    pub fn new(path: &Path) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(tx)
            .context("Failed to create shader file watcher")?;
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", path.display()))?;

        log::info!("Watching {} for changes", path.display());
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Drain pending events; true if the kernel file was written since
    /// the last poll. Editors that replace-on-save show up as Create.
    pub fn changed(&self) -> bool {
        let mut changed = false;
        loop {
            match self.rx.try_recv() {
                Ok(Ok(event)) => {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        changed = true;
                    }
                }
                Ok(Err(e)) => log::warn!("Shader watch error: {}", e),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        changed
    }
}
