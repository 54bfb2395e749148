// Candidate identity derived from folder structure
//
// Every file below the watched root belongs to the candidate named by its
// parent folder. The candidate id is a hash of the normalized relative path,
// so editing a file in place keeps its id and renaming it produces a new one.
// Ids are `pptx-` plus the first 10 hex chars of the path's MD5, the format
// the persistence layer already keys candidates by.

use std::path::Path;

use sha2::{Digest, Sha256};

use super::event::FileSignature;

const CANDIDATE_ID_PREFIX: &str = "pptx-";
const DEDUPE_KEY_PREFIX: &str = "ingest:dedupe:";
const CANDIDATE_ID_HEX_LEN: usize = 10;

/// Normalize a relative source path: forward slashes, no leading slash, no empty segments
pub fn normalize_rel_path(rel: &str) -> String {
  rel
    .replace('\\', "/")
    .split('/')
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join("/")
}

/// Relative path of `path` under `root` in normalized form, `None` when outside the root
pub fn rel_path(path: &Path, root: &Path) -> Option<String> {
  let rel = path.strip_prefix(root).ok()?;
  let normalized = normalize_rel_path(&rel.to_string_lossy());
  (!normalized.is_empty()).then_some(normalized)
}

/// Grouping key for all files of one candidate: the normalized parent folder.
///
/// Files directly under the root have no folder and are their own group.
pub fn candidate_key(rel: &str) -> String {
  let normalized = normalize_rel_path(rel);
  match normalized.rsplit_once('/') {
    Some((parent, _)) => parent.to_string(),
    None => normalized,
  }
}

/// Deterministic candidate id for a relative source path
pub fn candidate_id(rel: &str) -> String {
  let normalized = normalize_rel_path(rel);
  let hex = format!("{:x}", md5::compute(normalized.as_bytes()));
  format!("{}{}", CANDIDATE_ID_PREFIX, &hex[..CANDIDATE_ID_HEX_LEN])
}

/// Store key marking that `rel` was published with exactly this signature
pub fn dedupe_key(rel: &str, signature: &FileSignature) -> String {
  let material = format!("{}|{}", normalize_rel_path(rel), signature);
  format!("{}{}", DEDUPE_KEY_PREFIX, hex::encode(Sha256::digest(material.as_bytes())))
}

/// Top-level folder of a relative path, if the path has more than one segment
pub fn source_category(rel: &str) -> Option<String> {
  let normalized = normalize_rel_path(rel);
  normalized
    .split_once('/')
    .map(|(first, _)| first.to_string())
}

/// Folder directly holding the candidate's files when it sits below a category
///
/// `Engineering/backend_engineer/cv.txt` has role folder `backend_engineer`.
pub fn role_folder(rel: &str) -> Option<String> {
  candidate_key(rel)
    .rsplit_once('/')
    .map(|(_, folder)| folder.to_string())
}
