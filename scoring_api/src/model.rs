use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use telematics_core::ScoringContext;

/// Holds the scoring context once the artifact is available.
///
/// The context itself is immutable; the slot only goes from empty to loaded
/// so an artifact trained after startup is picked up without a restart.
pub struct ModelSlot {
    path: PathBuf,
    current: RwLock<Option<Arc<ScoringContext>>>,
}

impl ModelSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the artifact, then publish it.
    pub fn load(&self) -> Result<Arc<ScoringContext>> {
        let ctx = ScoringContext::load(&self.path)
            .with_context(|| format!("failed to load model artifact {}", self.path.display()))?;
        let ctx = Arc::new(ctx);

        let unknown = ctx.contract().unknown_names();
        if !unknown.is_empty() {
            tracing::warn!(
                "model requests {} feature(s) no period row provides, scoring them as 0.0: {:?}",
                unknown.len(),
                unknown
            );
        }
        tracing::info!(
            "loaded model ({:?}); feat_list[{}]: {:?}",
            ctx.capability(),
            ctx.contract().len(),
            ctx.contract().names()
        );

        *self.current.write() = Some(ctx.clone());
        Ok(ctx)
    }

    /// Current context, loading it first if the artifact has appeared.
    pub fn get(&self) -> Option<Arc<ScoringContext>> {
        if let Some(ctx) = self.current.read().as_ref() {
            return Some(ctx.clone());
        }
        if !self.path.exists() {
            return None;
        }
        match self.load() {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                tracing::warn!("{e:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_picks_up_late_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let slot = ModelSlot::new(&path);
        assert!(slot.get().is_none(), "no artifact yet");

        std::fs::write(&path, r#"{"model":{"kind":"constant","p":0.2}}"#).unwrap();
        let ctx = slot.get().expect("artifact appeared");
        assert_eq!(ctx.contract().len(), 10);

        // once loaded the same context is handed out
        std::fs::write(&path, "broken").unwrap();
        assert!(Arc::ptr_eq(&ctx, &slot.get().unwrap()));
    }

    #[test]
    fn test_invalid_artifact_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, r#"{"model":{"kind":"svm"}}"#).unwrap();
        let slot = ModelSlot::new(&path);
        let err = slot.load().unwrap_err();
        assert!(format!("{err:#}").contains("failed to load model artifact"));
        assert!(slot.get().is_none());
    }
}
