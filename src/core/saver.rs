use anyhow::Context;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "checkpoint";
const SECS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub step: u64,
    pub file: String,
    /// Seconds since the unix epoch.
    pub time: f64,
}

/// Contents of the `checkpoint` index file next to the weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Recent checkpoints, oldest first.
    pub recent: Vec<CheckpointEntry>,
    /// Checkpoints kept forever by the hourly rule.
    pub preserved: Vec<CheckpointEntry>,
    pub last_preserved_time: Option<f64>,
}

impl CheckpointState {
    pub fn latest(&self) -> Option<&CheckpointEntry> {
        self.recent.last()
    }

    /// Adds `entry` and returns the entries whose files should be deleted.
    ///
    /// At most `max_to_keep` recent entries stay. An entry falling out of
    /// that window is preserved instead of deleted when at least
    /// `keep_every_n_hours` passed since the last preserved one.
    pub fn record(
        &mut self,
        entry: CheckpointEntry,
        max_to_keep: usize,
        keep_every_n_hours: f64,
    ) -> Vec<CheckpointEntry> {
        if self.last_preserved_time.is_none() {
            self.last_preserved_time = Some(entry.time);
        }
        self.recent.retain(|e| e.file != entry.file);
        self.recent.push(entry);

        let mut expired = Vec::new();
        while self.recent.len() > max_to_keep.max(1) {
            let old = self.recent.remove(0);
            let last = self.last_preserved_time.unwrap_or(old.time);
            if old.time - last >= keep_every_n_hours * SECS_PER_HOUR {
                self.last_preserved_time = Some(old.time);
                self.preserved.push(old);
            } else {
                expired.push(old);
            }
        }
        expired
    }
}

/// Writes `model-<step>.safetensors` files and keeps the index current.
pub struct Saver {
    dir: PathBuf,
    max_to_keep: usize,
    keep_every_n_hours: f64,
    state: CheckpointState,
}

impl Saver {
    pub fn new(dir: &Path, max_to_keep: usize, keep_every_n_hours: f64) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let state = Self::read_state(dir)?.unwrap_or_default();
        Ok(Self {
            dir: dir.to_path_buf(),
            max_to_keep,
            keep_every_n_hours,
            state,
        })
    }

    pub fn read_state(dir: &Path) -> anyhow::Result<Option<CheckpointState>> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(&path)?;
        let state = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(state))
    }

    /// Path and step of the newest checkpoint, if one exists on disk.
    pub fn latest_checkpoint(&self) -> Option<(PathBuf, u64)> {
        self.state
            .latest()
            .map(|e| (self.dir.join(&e.file), e.step))
            .filter(|(p, _)| p.exists())
    }

    pub fn save(&mut self, varmap: &VarMap, step: u64) -> anyhow::Result<PathBuf> {
        let file = format!("model-{step}.safetensors");
        let path = self.dir.join(&file);
        varmap.save(&path)?;
        let time = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.commit(CheckpointEntry { step, file, time })?;
        log::info!("Saved checkpoint {}", path.display());
        Ok(path)
    }

    fn commit(&mut self, entry: CheckpointEntry) -> anyhow::Result<()> {
        let expired = self
            .state
            .record(entry, self.max_to_keep, self.keep_every_n_hours);
        for old in expired {
            let p = self.dir.join(&old.file);
            if let Err(e) = std::fs::remove_file(&p) {
                log::warn!("could not remove old checkpoint {}: {e}", p.display());
            }
        }
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        serde_json::to_writer_pretty(std::fs::File::create(&tmp)?, &self.state)?;
        std::fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }
}
