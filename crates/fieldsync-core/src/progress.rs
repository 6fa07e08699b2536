//! Bottom-up completion rollup for the Job → Floor → Unit → Area tree.
//!
//! Every level is derived from leaf state directly, so a level whose persisted
//! value could not be written never feeds a stale number into its ancestors.

use anyhow::{anyhow, Result};
use fieldsync_events::Bus;
use fieldsync_kernel::{AreaTally, Level, LocalStore, Record, Session};
use fieldsync_topics as topics;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

/// `round(100 × completed / eligible)`, or 0 when nothing is eligible.
pub fn area_percent(completed: i64, eligible: i64) -> i64 {
    if eligible <= 0 {
        return 0;
    }
    (100.0 * completed as f64 / eligible as f64).round() as i64
}

/// Rounded arithmetic mean, or 0 for no values.
pub fn mean_percent(values: &[i64]) -> i64 {
    if values.is_empty() {
        return 0;
    }
    let sum: i64 = values.iter().sum();
    (sum as f64 / values.len() as f64).round() as i64
}

fn tally_percent(t: &AreaTally) -> i64 {
    area_percent(t.completed, t.eligible)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelProgress {
    pub level: Level,
    pub id: String,
    pub percent: i64,
}

/// Values computed by one rollup pass, leaf-most first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Rollup {
    pub levels: Vec<LevelProgress>,
    /// Levels whose computed value could not be written locally.
    pub persist_failures: usize,
}

impl Rollup {
    pub fn percent(&self, level: Level, id: &str) -> Option<i64> {
        self.levels
            .iter()
            .find(|l| l.level == level && l.id == id)
            .map(|l| l.percent)
    }

    fn push(&mut self, s: &Session, level: Level, id: &str, percent: i64) {
        if let Err(err) = persist(s, level, id, percent) {
            warn!(
                target: "fieldsync::progress",
                ?level, id, percent, %err,
                "progress persist failed; continuing rollup"
            );
            self.persist_failures += 1;
        }
        self.levels.push(LevelProgress {
            level,
            id: id.to_string(),
            percent,
        });
    }
}

/// Write `percent` to the owning row when it changed. Goes through the row
/// path so remote list views receive the new summary too.
fn persist(s: &Session, level: Level, id: &str, percent: i64) -> Result<bool> {
    let stored = s
        .progress()
        .stored_progress(level, id)?
        .ok_or_else(|| anyhow!("{:?} {} has no local row", level, id))?;
    if stored == percent {
        return Ok(false);
    }
    let mut patch = Record::new();
    patch.insert("progress".into(), json!(percent));
    s.rows().update(level.table(), id, &patch)?;
    Ok(true)
}

fn floor_percent(s: &Session, floor_id: &str) -> Result<i64> {
    let tallies = s.progress().tallies_in_floor(floor_id)?;
    Ok(mean_percent(
        &tallies.iter().map(tally_percent).collect::<Vec<_>>(),
    ))
}

fn job_percent(s: &Session, job_id: &str) -> Result<i64> {
    let floors = s.progress().floors_of_job(job_id)?;
    let mut values = Vec::with_capacity(floors.len());
    for f in &floors {
        values.push(floor_percent(s, f)?);
    }
    Ok(mean_percent(&values))
}

/// Recompute the area and each of its ancestors.
pub fn rollup_from_area(s: &Session, area_id: &str) -> Result<Rollup> {
    let tree = s.progress();
    let mut rollup = Rollup::default();

    let area = tally_percent(&tree.tally_area(area_id)?);
    rollup.push(s, Level::Area, area_id, area);

    let Some(unit_id) = tree.unit_of_area(area_id)? else {
        debug!(target: "fieldsync::progress", area_id, "area has no unit; rollup stops");
        return Ok(rollup);
    };
    let unit = mean_percent(
        &tree
            .tallies_in_unit(&unit_id)?
            .iter()
            .map(tally_percent)
            .collect::<Vec<_>>(),
    );
    rollup.push(s, Level::Unit, &unit_id, unit);

    let Some(floor_id) = tree.floor_of_unit(&unit_id)? else {
        return Ok(rollup);
    };
    let floor = floor_percent(s, &floor_id)?;
    rollup.push(s, Level::Floor, &floor_id, floor);

    let Some(job_id) = tree.job_of_floor(&floor_id)? else {
        return Ok(rollup);
    };
    let job = job_percent(s, &job_id)?;
    rollup.push(s, Level::Job, &job_id, job);
    Ok(rollup)
}

/// Recompute every level under `job_id`.
pub fn rollup_job(s: &Session, job_id: &str) -> Result<Rollup> {
    let tree = s.progress();
    let mut rollup = Rollup::default();
    let mut floor_values = Vec::new();
    for floor_id in tree.floors_of_job(job_id)? {
        for unit_id in tree.units_of_floor(&floor_id)? {
            let tallies = tree.tallies_in_unit(&unit_id)?;
            for t in &tallies {
                rollup.push(s, Level::Area, &t.area_id, tally_percent(t));
            }
            let unit = mean_percent(&tallies.iter().map(tally_percent).collect::<Vec<_>>());
            rollup.push(s, Level::Unit, &unit_id, unit);
        }
        let floor = floor_percent(s, &floor_id)?;
        rollup.push(s, Level::Floor, &floor_id, floor);
        floor_values.push(floor);
    }
    rollup.push(s, Level::Job, job_id, mean_percent(&floor_values));
    Ok(rollup)
}

/// Keeps ancestor percentages consistent with leaf state.
#[derive(Clone)]
pub struct ProgressAggregator {
    store: LocalStore,
    bus: Bus,
}

impl ProgressAggregator {
    pub fn new(store: LocalStore, bus: Bus) -> Self {
        Self { store, bus }
    }

    /// Roll up after a checklist item changed. Unknown items yield an empty rollup.
    pub async fn on_leaf_changed(&self, item_id: &str) -> Result<Rollup> {
        let item = item_id.to_string();
        let rollup = self
            .store
            .call(move |s| match s.progress().area_of_item(&item)? {
                Some(area_id) => rollup_from_area(s, &area_id),
                None => Ok(Rollup::default()),
            })
            .await?;
        self.announce(&rollup);
        Ok(rollup)
    }

    pub async fn recompute_area(&self, area_id: &str) -> Result<Rollup> {
        let area = area_id.to_string();
        let rollup = self
            .store
            .call(move |s| rollup_from_area(s, &area))
            .await?;
        self.announce(&rollup);
        Ok(rollup)
    }

    pub async fn recompute_job(&self, job_id: &str) -> Result<Rollup> {
        let job = job_id.to_string();
        let rollup = self.store.call(move |s| rollup_job(s, &job)).await?;
        self.announce(&rollup);
        Ok(rollup)
    }

    fn announce(&self, rollup: &Rollup) {
        if !rollup.levels.is_empty() {
            self.bus.publish(topics::TOPIC_PROGRESS_UPDATED, rollup);
        }
    }
}
