//! Candidate-file arbitration
//!
//! A candidate folder often holds several versions of the same CV
//! (`cv.pptx`, `cv_backup.pptx`, `cv copy.pptx`). Exactly one of them is
//! authoritative at any time:
//!
//! 1. non-archived files outrank archived ones, whatever their age
//! 2. among files with the same archived status the newest mtime wins
//! 3. remaining ties go to the lexicographically smallest path
//!
//! "Archived" is decided from the filename stem alone: it is split on
//! non-alphanumerics and any token in [`ARCHIVED_TOKENS`] marks the file.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use tracing::trace;

use crate::domain::{
  config::WatchConfig,
  event::FileSignature,
  identity::{candidate_key, rel_path},
};

/// Filename tokens that mark a file as an archived copy
pub const ARCHIVED_TOKENS: &[&str] = &["archive", "archived", "backup", "copy", "old"];

fn filename_tokens(path: &Path) -> Vec<String> {
  let stem = path
    .file_stem()
    .map(|s| s.to_string_lossy().to_lowercase())
    .unwrap_or_default();

  stem
    .split(|c: char| !c.is_ascii_alphanumeric())
    .filter(|token| !token.is_empty())
    .map(str::to_string)
    .collect()
}

/// Returns true if the filename stem carries an archive token
pub fn is_archived_filename(path: &Path) -> bool {
  filename_tokens(path)
    .iter()
    .any(|token| ARCHIVED_TOKENS.contains(&token.as_str()))
}

// ============================================================================
// File Filter
// ============================================================================

/// Decides which paths are CV payloads at all
#[derive(Debug, Clone)]
pub struct FileFilter {
  extensions: Vec<String>,
  temp_prefixes: Vec<String>,
}

impl FileFilter {
  pub fn new<E, P>(extensions: E, temp_prefixes: P) -> Self
  where
    E: IntoIterator,
    E::Item: AsRef<str>,
    P: IntoIterator,
    P::Item: AsRef<str>,
  {
    Self {
      extensions: extensions
        .into_iter()
        .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
        .collect(),
      temp_prefixes: temp_prefixes.into_iter().map(|p| p.as_ref().to_string()).collect(),
    }
  }

  pub fn from_config(config: &WatchConfig) -> Self {
    Self::new(&config.extensions, &config.temp_prefixes)
  }

  /// Name and extension checks only, no filesystem access
  pub fn matches_name(&self, path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
      return false;
    };

    // Office writes "~$Resume.pptx" while a document is open
    if self.temp_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
      return false;
    }

    path
      .extension()
      .map(|ext| ext.to_string_lossy().to_lowercase())
      .is_some_and(|ext| self.extensions.contains(&ext))
  }

  /// Name checks plus "is a regular file right now"
  pub fn accepts(&self, path: &Path) -> bool {
    self.matches_name(path) && path.is_file()
  }
}

// ============================================================================
// Selection
// ============================================================================

/// Rank used to pick the authoritative file; higher wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
  not_archived: bool,
  mtime_ns: i64,
}

fn rank(path: &Path) -> std::io::Result<Rank> {
  let meta = std::fs::metadata(path)?;
  let signature = FileSignature::from_metadata(&meta)?;
  Ok(Rank {
    not_archived: !is_archived_filename(path),
    mtime_ns: signature.mtime_ns,
  })
}

fn pick_best<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) -> Option<&'a PathBuf> {
  let mut best: Option<(Rank, &PathBuf)> = None;

  for path in paths {
    let score = match rank(path) {
      Ok(score) => score,
      Err(e) => {
        trace!(path = %path.display(), error = %e, "Skipping file that cannot be stat'd");
        continue;
      }
    };

    let better = match &best {
      None => true,
      Some((best_score, best_path)) => score > *best_score || (score == *best_score && path < *best_path),
    };
    if better {
      best = Some((score, path));
    }
  }

  best.map(|(_, path)| path)
}

/// Group files by candidate key and pick one authoritative file per group
///
/// Files outside `root` and files that cannot be stat'd are skipped.
pub fn select_latest(files: &[PathBuf], root: &Path) -> BTreeMap<String, PathBuf> {
  let mut grouped: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
  for path in files {
    let Some(rel) = rel_path(path, root) else {
      continue;
    };
    grouped.entry(candidate_key(&rel)).or_default().push(path.clone());
  }

  grouped
    .into_iter()
    .filter_map(|(key, paths)| pick_best(&paths).cloned().map(|best| (key, best)))
    .collect()
}

/// Candidate-file arbitration bound to a watched root
#[derive(Debug, Clone)]
pub struct FileSelector {
  root: PathBuf,
  filter: FileFilter,
}

impl FileSelector {
  pub fn new(root: impl Into<PathBuf>, filter: FileFilter) -> Self {
    Self {
      root: root.into(),
      filter,
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn filter(&self) -> &FileFilter {
    &self.filter
  }

  pub fn select_latest(&self, files: &[PathBuf]) -> BTreeMap<String, PathBuf> {
    select_latest(files, &self.root)
  }

  /// Re-check that `path` still wins its candidate group.
  ///
  /// A newer or non-archived sibling may have landed while `path` was
  /// stabilizing; in that case the sibling fires its own event.
  pub fn is_latest(&self, path: &Path) -> bool {
    let Some(rel) = rel_path(path, &self.root) else {
      return false;
    };
    let key = candidate_key(&rel);

    // Top-level files are their own group
    if key == rel {
      return true;
    }

    let Some(candidate_dir) = path.parent() else {
      return true;
    };
    let entries = match std::fs::read_dir(candidate_dir) {
      Ok(entries) => entries,
      Err(e) => {
        trace!(dir = %candidate_dir.display(), error = %e, "Candidate folder unreadable, nothing to contest");
        return true;
      }
    };

    let siblings: Vec<PathBuf> = entries
      .filter_map(|entry| entry.ok())
      .map(|entry| entry.path())
      .filter(|sibling| self.filter.accepts(sibling))
      .collect();

    if siblings.is_empty() {
      return false;
    }

    select_latest(&siblings, &self.root).get(&key).is_some_and(|winner| winner == path)
  }
}
