//! PositionStore - Persisted Pan/Tilt Angles
//!
//! Last acknowledged servo angles, written after every acknowledged move
//! so a restart resumes from the last known position instead of
//! re-centering mid-session. The file holds two ASCII integers; writes go
//! through a temp file + rename so readers in other processes never see a
//! torn value.

use crate::error::{Error, Result};
use crate::servo_link::{ANGLE_MAX, ANGLE_MIN, ANGLE_REST};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Bounded pan/tilt pair. Always within the servo range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanTilt {
    pub pan: i64,
    pub tilt: i64,
}

impl PanTilt {
    /// Rest / center position
    pub fn rest() -> Self {
        Self {
            pan: ANGLE_REST,
            tilt: ANGLE_REST,
        }
    }

    /// Clamp both axes into the servo range
    pub fn clamped(pan: i64, tilt: i64) -> Self {
        Self {
            pan: pan.clamp(ANGLE_MIN, ANGLE_MAX),
            tilt: tilt.clamp(ANGLE_MIN, ANGLE_MAX),
        }
    }

    fn in_range(v: i64) -> bool {
        (ANGLE_MIN..=ANGLE_MAX).contains(&v)
    }
}

/// PositionStore instance
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    /// Create new PositionStore backed by `path`
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the persisted position. A missing file, unparseable content
    /// or out-of-range values all fall back to the rest position.
    pub async fn load(&self) -> PanTilt {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::info!(
                    path = %self.path.display(),
                    error = %e,
                    "No persisted position, starting at rest"
                );
                return PanTilt::rest();
            }
        };

        match parse_position(&raw) {
            Some(pos) => pos,
            None => {
                tracing::warn!(
                    path = %self.path.display(),
                    content = %raw.trim(),
                    "Invalid persisted position, replaced by rest"
                );
                PanTilt::rest()
            }
        }
    }

    /// Atomically persist `position` (temp file + rename)
    pub async fn save(&self, position: PanTilt) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{} {}\n", position.pan, position.tilt)).await?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("position rename failed: {}", e),
            ))
        })?;

        tracing::debug!(
            pan = position.pan,
            tilt = position.tilt,
            "Position persisted"
        );
        Ok(())
    }
}

fn parse_position(raw: &str) -> Option<PanTilt> {
    let mut parts = raw.split_whitespace();
    let pan: i64 = parts.next()?.parse().ok()?;
    let tilt: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    if !PanTilt::in_range(pan) || !PanTilt::in_range(tilt) {
        return None;
    }
    Some(PanTilt { pan, tilt })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> PositionStore {
        PositionStore::new(dir.path().join("position"))
    }

    #[tokio::test]
    async fn test_missing_file_loads_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.load().await, PanTilt::rest());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let pos = PanTilt { pan: 42, tilt: 200 };
        store.save(pos).await.unwrap();
        assert_eq!(store.load().await, pos);
    }

    #[tokio::test]
    async fn test_out_of_range_replaced_by_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position");
        tokio::fs::write(&path, "500 100\n").await.unwrap();
        let store = PositionStore::new(path);
        assert_eq!(store.load().await, PanTilt::rest());
    }

    #[tokio::test]
    async fn test_garbage_replaced_by_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position");
        tokio::fs::write(&path, "not a position").await.unwrap();
        let store = PositionStore::new(path);
        assert_eq!(store.load().await, PanTilt::rest());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(PanTilt { pan: 10, tilt: 20 }).await.unwrap();
        store.save(PanTilt { pan: 30, tilt: 40 }).await.unwrap();
        assert_eq!(store.load().await, PanTilt { pan: 30, tilt: 40 });
    }

    #[test]
    fn test_clamped_constructor() {
        let pos = PanTilt::clamped(-5, 999);
        assert_eq!(pos, PanTilt { pan: 0, tilt: 270 });
    }
}
