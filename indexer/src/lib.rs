use edaoogle_core::tokenizer::tokenize;
use edaoogle_core::{Frequency, IndexError, IndexWriter, MetaFile, Result};
use walkdir::WalkDir;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Descend into subdirectories; documents are then keyed by their
    /// corpus-relative path instead of their bare file name.
    pub recursive: bool,
    /// Checked between documents; once set the build stops without publishing.
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone)]
pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub meta: MetaFile,
    pub skipped: Vec<SkippedDocument>,
    pub elapsed: Duration,
}

/// Keyword counts for one document.
pub fn document_counts(content: &[u8]) -> BTreeMap<String, Frequency> {
    let mut counts: BTreeMap<String, Frequency> = BTreeMap::new();
    for token in tokenize(content) {
        let n = counts.entry(token).or_insert(0);
        *n = n.saturating_add(1);
    }
    counts
}

/// Index every document under `corpus_root` into a fresh generation under
/// `index_root` and publish it. Unreadable documents are skipped; a missing
/// corpus or an unwritable destination fails before anything is written.
pub fn build_index(corpus_root: &Path, index_root: &Path, options: &BuildOptions) -> Result<BuildReport> {
    let start = Instant::now();
    if !corpus_root.is_dir() {
        return Err(IndexError::MissingCorpus(corpus_root.to_path_buf()));
    }
    let mut writer = IndexWriter::create(index_root)?;
    tracing::info!(corpus = %corpus_root.display(), generation = writer.generation(), recursive = options.recursive, "building index");

    let max_depth = if options.recursive { usize::MAX } else { 1 };
    let mut skipped: Vec<SkippedDocument> = Vec::new();
    let mut documents = 0u64;

    for entry in WalkDir::new(corpus_root).min_depth(1).max_depth(max_depth).sort_by_file_name() {
        if options.cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst)) {
            tracing::warn!(documents, "build interrupted; nothing published");
            return Err(IndexError::Interrupted);
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| corpus_root.to_path_buf());
                skip(&mut writer, &mut skipped, path, e.to_string());
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_dir() {
            continue;
        }
        // follows symlinks, so a dangling link lands in `skip` below
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => {}
            Err(e) => {
                skip(&mut writer, &mut skipped, path.to_path_buf(), e.to_string());
                continue;
            }
        }
        let Some(url) = document_url(corpus_root, path, options.recursive) else {
            skip(&mut writer, &mut skipped, path.to_path_buf(), "file name is not valid UTF-8".into());
            continue;
        };
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) => {
                skip(&mut writer, &mut skipped, path.to_path_buf(), e.to_string());
                continue;
            }
        };
        writer.put_document(&url, &document_counts(&content))?;
        documents += 1;
    }

    tracing::info!(documents, skipped = skipped.len(), "ingested documents");
    let meta = writer.commit()?;
    let elapsed = start.elapsed();
    tracing::info!(generation = meta.generation, num_postings = meta.num_postings, ?elapsed, "index build complete");
    Ok(BuildReport { meta, skipped, elapsed })
}

fn skip(writer: &mut IndexWriter, skipped: &mut Vec<SkippedDocument>, path: PathBuf, reason: String) {
    tracing::warn!(path = %path.display(), %reason, "skipping unreadable document");
    writer.record_skipped();
    skipped.push(SkippedDocument { path, reason });
}

/// Url key of a document, or `None` when its name is not valid UTF-8 and
/// could collide with another document after lossy conversion.
fn document_url(corpus_root: &Path, path: &Path, recursive: bool) -> Option<String> {
    if recursive {
        let relative = path.strip_prefix(corpus_root).unwrap_or(path);
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        parts.map(|parts| parts.join("/"))
    } else {
        path.file_name()?.to_str().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_keywords_per_document() {
        let counts = document_counts(b"<p>fish Fish</p> cat");
        assert_eq!(counts.get("fish"), Some(&2));
        assert_eq!(counts.get("cat"), Some(&1));
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn url_is_file_name_unless_recursive() {
        let root = Path::new("/corpus");
        let path = Path::new("/corpus/wiki/Cat.html");
        assert_eq!(document_url(root, path, false).as_deref(), Some("Cat.html"));
        assert_eq!(document_url(root, path, true).as_deref(), Some("wiki/Cat.html"));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_names_have_no_url() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let root = Path::new("/corpus");
        let path = root.join(OsStr::from_bytes(b"caf\xe9.html"));
        assert_eq!(document_url(root, &path, false), None);
        assert_eq!(document_url(root, &path, true), None);
    }
}
