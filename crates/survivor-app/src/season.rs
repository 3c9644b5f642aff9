// Season file: the JSON document the CLI reads at startup and writes back.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use survivor_core::model::{LeagueChoice, UserId};
use survivor_core::race_state::RaceSchedule;
use survivor_core::store::SeasonSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonFile {
    #[serde(default)]
    pub schedule: RaceSchedule,
    /// Each user's last active-league choice.
    #[serde(default)]
    pub active_leagues: HashMap<UserId, LeagueChoice>,
    #[serde(flatten)]
    pub data: SeasonSnapshot,
}

impl SeasonFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        serde_json::from_str(&text).context("season file is not valid JSON")
    }

    /// Write through a temporary file so a crash never leaves a torn file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize season")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("cannot write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("cannot replace {}", path.display()))?;
        Ok(())
    }
}
