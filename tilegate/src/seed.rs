//! Offline seeding and cleanup.
//!
//! The seeder drives the same tile manager operations a live request
//! would, walking every meta-tile of the configured levels that
//! intersects the seed coverage. Progress is persisted after each
//! completed meta-tile so an interrupted run can continue where it
//! stopped.

use crate::manager::{CreationMode, TileManager};
use anyhow::{Context, Result};
use futures::StreamExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::SystemTime,
};
use tilegate_core::{Coverage, RefreshPolicy, TileCoord};

/// One seeding (or cleanup) task.
#[derive(Clone)]
pub struct SeedTask {
	pub name: String,
	pub manager: Arc<TileManager>,
	pub levels: Vec<u8>,
	/// Area to seed; `None` seeds the whole grid. An empty coverage is a
	/// no-op.
	pub coverage: Option<Coverage>,
	/// Re-create tiles older than this even when cached.
	pub refresh_before: Option<RefreshPolicy>,
	/// Meta-tiles built concurrently.
	pub workers: usize,
}

impl SeedTask {
	pub fn new(name: &str, manager: Arc<TileManager>, levels: Vec<u8>) -> SeedTask {
		SeedTask {
			name: name.to_string(),
			manager,
			levels,
			coverage: None,
			refresh_before: None,
			workers: 2,
		}
	}
}

/// Counters reported back to the seeding driver.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SeedStats {
	pub metas_total: usize,
	pub metas_seeded: usize,
	pub metas_skipped: usize,
	pub tiles_removed: usize,
}

/// Persistent continuation state, one entry per level: the number of
/// meta-tiles already completed (in walk order).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SeedProgress {
	pub task: String,
	pub completed: HashMap<u8, usize>,
}

impl SeedProgress {
	pub fn load(path: &Path) -> Result<SeedProgress> {
		let bytes = std::fs::read(path).with_context(|| format!("reading progress file {path:?}"))?;
		serde_json::from_slice(&bytes).with_context(|| format!("parsing progress file {path:?}"))
	}

	fn save(&self, path: &Path) -> Result<()> {
		let bytes = serde_json::to_vec_pretty(self)?;
		let temp = path.with_extension("tmp");
		std::fs::write(&temp, bytes)?;
		std::fs::rename(&temp, path)?;
		Ok(())
	}
}

/// The meta-tiles of `task` at `level` that intersect the coverage, in
/// deterministic walk order.
fn level_metas(task: &SeedTask, level: u8) -> Result<Vec<(u32, u32, Vec<TileCoord>)>> {
	let grid = task.manager.grid();
	let meta_size = task.manager.opts().meta_size;

	let seed_bbox = match &task.coverage {
		Some(coverage) if coverage.is_empty() => return Ok(Vec::new()),
		Some(coverage) => {
			let coverage = coverage.transform_to(grid.srs(), task.manager.registry())?;
			*coverage.extent()
		}
		None => *grid.bbox(),
	};
	let coverage = match &task.coverage {
		Some(coverage) => Some(coverage.transform_to(grid.srs(), task.manager.registry())?),
		None => None,
	};

	let range = grid.tiles_for_bbox(&seed_bbox, level)?;
	if range.is_empty() {
		return Ok(Vec::new());
	}

	let mut metas = Vec::new();
	let (mx0, my0) = (range.x0 / meta_size.0, range.y0 / meta_size.1);
	let (mx1, my1) = (range.x1 / meta_size.0, range.y1 / meta_size.1);
	for my in my0..=my1 {
		for mx in mx0..=mx1 {
			let meta = task.manager_meta(level, mx, my)?;
			// prune meta blocks entirely outside the seed area
			if let Some(coverage) = &coverage {
				if !coverage.intersects(&meta.1) {
					continue;
				}
			}
			metas.push((mx, my, meta.0));
		}
	}
	Ok(metas)
}

impl SeedTask {
	/// The tiles and bbox of one meta block.
	fn manager_meta(&self, level: u8, mx: u32, my: u32) -> Result<(Vec<TileCoord>, tilegate_core::MapBBox)> {
		let meta_size = self.manager.opts().meta_size;
		let grid = self.manager.grid();
		let (grid_w, grid_h) = grid.grid_sizes(level)?;
		let x0 = mx * meta_size.0;
		let y0 = my * meta_size.1;
		let range = tilegate_core::TileRange {
			z: level,
			x0,
			y0,
			x1: (x0 + meta_size.0 - 1).min(grid_w - 1),
			y1: (y0 + meta_size.1 - 1).min(grid_h - 1),
		};
		Ok((range.iter().collect(), grid.range_bbox(&range)))
	}
}

/// Seeds all levels of `task`. With a progress file, completed meta-tiles
/// are recorded and `resume` continues after them.
pub async fn seed(
	task: &SeedTask,
	progress_file: Option<&Path>,
	resume: bool,
) -> Result<SeedStats> {
	let progress = Arc::new(Mutex::new(match (progress_file, resume) {
		(Some(path), true) if path.exists() => {
			let loaded = SeedProgress::load(path)?;
			if loaded.task != task.name {
				warn!(
					"progress file belongs to task '{}', starting '{}' fresh",
					loaded.task, task.name
				);
				SeedProgress {
					task: task.name.clone(),
					completed: HashMap::new(),
				}
			} else {
				loaded
			}
		}
		_ => SeedProgress {
			task: task.name.clone(),
			completed: HashMap::new(),
		},
	}));

	let mut stats = SeedStats::default();
	for level in &task.levels {
		let metas = level_metas(task, *level)?;
		stats.metas_total += metas.len();

		let skip = progress.lock().unwrap().completed.get(level).copied().unwrap_or(0);
		stats.metas_skipped += skip.min(metas.len());

		let completed = Arc::new(AtomicUsize::new(skip));
		let progress_path: Option<PathBuf> = progress_file.map(Path::to_path_buf);

		futures::stream::iter(metas.into_iter().skip(skip))
			.map(|(_, _, coords)| {
				let manager = task.manager.clone();
				let completed = completed.clone();
				let progress = progress.clone();
				let progress_path = progress_path.clone();
				let level = *level;
				let refresh_before = task.refresh_before;
				async move {
					// force re-creation of tiles older than the refresh cutoff
					if let Some(policy) = refresh_before {
						let cached = manager.cache().load_many(&coords, true).await?;
						for tile in cached {
							if let Some(mtime) = tile.mtime {
								if tile.is_cached() && policy.is_expired(mtime) {
									manager.cache().remove(&tile.coord).await?;
								}
							}
						}
					}
					manager.load_tiles(&coords, CreationMode::Seed).await?;
					let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
					if let Some(path) = &progress_path {
						let mut progress = progress.lock().unwrap();
						progress.completed.insert(level, done);
						if let Err(err) = progress.save(path) {
							warn!("could not save seed progress: {err:#}");
						}
					}
					anyhow::Ok(())
				}
			})
			.buffer_unordered(task.workers.max(1))
			.collect::<Vec<_>>()
			.await
			.into_iter()
			.collect::<Result<Vec<_>>>()?;

		let done = completed.load(Ordering::SeqCst);
		stats.metas_seeded += done.saturating_sub(skip);
		info!("seeded level {level} of '{}' ({done} metas)", task.name);
	}
	Ok(stats)
}

/// Removes (or lets expire) all tiles of the task's levels and coverage
/// older than `before`.
pub async fn cleanup(task: &SeedTask, before: SystemTime) -> Result<SeedStats> {
	let mut stats = SeedStats::default();
	for level in &task.levels {
		let metas = level_metas(task, *level)?;
		for (_, _, coords) in metas {
			let tiles = task.manager.cache().load_many(&coords, true).await?;
			for tile in tiles {
				let Some(mtime) = tile.mtime else {
					continue;
				};
				if tile.is_cached() && mtime < before {
					task.manager.cache().remove(&tile.coord).await?;
					stats.tiles_removed += 1;
				}
			}
		}
	}
	info!("cleanup of '{}' removed {} tiles", task.name, stats.tiles_removed);
	Ok(stats)
}
