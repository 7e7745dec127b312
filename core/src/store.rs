use crate::error::{IndexError, Result};
use crate::index::{Frequency, Posting};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CURRENT: &str = "CURRENT";
const GENERATION_PREFIX: &str = "gen-";
const META_VERSION: u32 = 2;
const DOCUMENTS_TREE: &str = "documents";
const KEY_SEPARATOR: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u32,
    pub generation: u64,
    pub created_at: String,
    pub num_documents: u64,
    pub num_keywords: u64,
    pub num_postings: u64,
    pub skipped_documents: u64,
}

/// Location of one keyword's postings block inside `postings.bin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct BlockRef {
    offset: u64,
    len: u64,
}

type Dictionary = BTreeMap<String, BlockRef>;

/// Layout of an index root: numbered generation directories plus the `CURRENT`
/// pointer naming the published one.
///
/// A published generation holds `meta.json`, `dictionary.bin` (keyword to
/// block) and `postings.bin` (one bincode `Vec<(url, frequency)>` per keyword,
/// urls ascending). Both binary files are written once and only ever opened
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    fn current(&self) -> PathBuf { self.root.join(CURRENT) }
    fn current_tmp(&self) -> PathBuf { self.root.join(format!("{CURRENT}.tmp")) }
    pub fn generation(&self, generation: u64) -> PathBuf {
        self.root.join(generation_name(generation))
    }
    fn build_db(&self, generation: u64) -> PathBuf { self.generation(generation).join("build") }
    fn meta(&self, generation: u64) -> PathBuf { self.generation(generation).join("meta.json") }
    fn dictionary(&self, generation: u64) -> PathBuf { self.generation(generation).join("dictionary.bin") }
    pub fn postings_file(&self, generation: u64) -> PathBuf { self.generation(generation).join("postings.bin") }

    /// Generation named by `CURRENT`, or `None` when nothing has been published yet.
    pub fn published_generation(&self) -> Result<Option<u64>> {
        let mut f = match File::open(self.current()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut buf = String::new();
        f.read_to_string(&mut buf)?;
        parse_generation(buf.trim())
            .map(Some)
            .ok_or_else(|| IndexError::Corrupt(format!("bad CURRENT pointer {:?}", buf.trim())))
    }
}

fn generation_name(generation: u64) -> String {
    format!("{GENERATION_PREFIX}{generation:016}")
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix(GENERATION_PREFIX)?.parse().ok()
}

pub fn save_meta(paths: &IndexPaths, meta: &MetaFile) -> Result<()> {
    let mut f = File::create(paths.meta(meta.generation))?;
    let json = serde_json::to_string_pretty(meta)?;
    f.write_all(json.as_bytes())?;
    f.sync_all()?;
    Ok(())
}

pub fn load_meta(paths: &IndexPaths, generation: u64) -> Result<MetaFile> {
    let mut f = File::open(paths.meta(generation))?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let meta: MetaFile = serde_json::from_str(&buf)?;
    Ok(meta)
}

fn save_dictionary(paths: &IndexPaths, generation: u64, dict: &Dictionary) -> Result<()> {
    let mut f = File::create(paths.dictionary(generation))?;
    let bytes = bincode::serialize(dict)?;
    f.write_all(&bytes)?;
    f.sync_all()?;
    Ok(())
}

fn load_dictionary(paths: &IndexPaths, generation: u64) -> Result<Dictionary> {
    let mut f = File::open(paths.dictionary(generation))?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    let dict = bincode::deserialize(&buf)?;
    Ok(dict)
}

fn posting_key(keyword: &str, url: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(keyword.len() + url.len() + 1);
    key.extend_from_slice(keyword.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(url.as_bytes());
    key
}

fn split_key(key: &[u8]) -> Result<(String, String)> {
    let split = key
        .iter()
        .position(|b| *b == KEY_SEPARATOR)
        .ok_or_else(|| IndexError::Corrupt("posting key without separator".into()))?;
    let keyword = std::str::from_utf8(&key[..split])
        .map_err(|e| IndexError::Corrupt(format!("posting keyword: {e}")))?;
    let url = std::str::from_utf8(&key[split + 1..])
        .map_err(|e| IndexError::Corrupt(format!("posting url: {e}")))?;
    Ok((keyword.to_string(), url.to_string()))
}

/// Builds one new generation. Nothing it writes is visible to readers until
/// [`IndexWriter::commit`] swaps `CURRENT`; dropping an uncommitted writer
/// deletes the generation.
pub struct IndexWriter {
    paths: IndexPaths,
    generation: u64,
    db: Option<sled::Db>,
    skipped: u64,
    committed: bool,
}

impl IndexWriter {
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let paths = IndexPaths::new(root);
        let unwritable = |source| IndexError::UnwritableDestination { path: paths.root.clone(), source };
        fs::create_dir_all(&paths.root).map_err(unwritable)?;
        let generation = paths.published_generation()?.map_or(1, |g| g + 1);
        let dir = paths.generation(generation);
        if dir.exists() {
            // leftover of a build that never published
            fs::remove_dir_all(&dir).map_err(unwritable)?;
        }
        fs::create_dir_all(&dir).map_err(unwritable)?;
        let db = sled::open(paths.build_db(generation))?;
        debug!(generation, dir = %dir.display(), "opened index generation for writing");
        Ok(Self { paths, generation, db: Some(db), skipped: 0, committed: false })
    }

    pub fn generation(&self) -> u64 { self.generation }

    fn db(&self) -> Result<&sled::Db> {
        self.db.as_ref().ok_or_else(|| IndexError::Corrupt("index writer already closed".into()))
    }

    /// Store the keyword counts of one document, replacing whatever this
    /// generation already holds for `url`.
    pub fn put_document(&mut self, url: &str, counts: &BTreeMap<String, Frequency>) -> Result<()> {
        let db = self.db()?;
        let documents = db.open_tree(DOCUMENTS_TREE)?;
        let mut batch = sled::Batch::default();
        if let Some(previous) = documents.get(url.as_bytes())? {
            let keywords: Vec<String> = bincode::deserialize(&previous)?;
            for keyword in keywords {
                batch.remove(posting_key(&keyword, url));
            }
        }
        for (keyword, frequency) in counts {
            batch.insert(posting_key(keyword, url), bincode::serialize(frequency)?);
        }
        db.apply_batch(batch)?;
        let keywords: Vec<&String> = counts.keys().collect();
        documents.insert(url.as_bytes(), bincode::serialize(&keywords)?)?;
        Ok(())
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    /// Write the read-side files, publish this generation, then prune
    /// generations older than the one it replaces.
    pub fn commit(mut self) -> Result<MetaFile> {
        let db = self
            .db
            .take()
            .ok_or_else(|| IndexError::Corrupt("index writer already closed".into()))?;
        db.flush()?;
        let num_documents = db.open_tree(DOCUMENTS_TREE)?.len() as u64;
        let (dictionary, num_postings) = self.write_postings(&db)?;
        drop(db);
        if let Err(e) = fs::remove_dir_all(self.paths.build_db(self.generation)) {
            warn!(generation = self.generation, error = %e, "could not remove build scratch database");
        }
        save_dictionary(&self.paths, self.generation, &dictionary)?;

        let created_at = time::OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339)?;
        let meta = MetaFile {
            version: META_VERSION,
            generation: self.generation,
            created_at,
            num_documents,
            num_keywords: dictionary.len() as u64,
            num_postings,
            skipped_documents: self.skipped,
        };
        save_meta(&self.paths, &meta)?;
        self.publish()?;
        self.committed = true;
        info!(generation = self.generation, num_documents, num_postings, "published index generation");
        self.prune();
        Ok(meta)
    }

    // sled iterates keys in byte order, and the separator sorts below every
    // letter, so each keyword's urls arrive contiguous and ascending.
    fn write_postings(&self, db: &sled::Db) -> Result<(Dictionary, u64)> {
        let file = File::create(self.paths.postings_file(self.generation))?;
        let mut out = BufWriter::new(file);
        let mut dictionary = Dictionary::new();
        let mut offset = 0u64;
        let mut num_postings = 0u64;
        let mut current: Option<(String, Vec<(String, Frequency)>)> = None;

        for entry in db.iter() {
            let (key, value) = entry?;
            let (keyword, url) = split_key(&key)?;
            let frequency: Frequency = bincode::deserialize(&value)?;
            num_postings += 1;
            if let Some((k, block)) = current.as_mut() {
                if *k == keyword {
                    block.push((url, frequency));
                    continue;
                }
            }
            if let Some((k, block)) = current.take() {
                offset += write_block(&mut out, &mut dictionary, offset, k, &block)?;
            }
            current = Some((keyword, vec![(url, frequency)]));
        }
        if let Some((k, block)) = current.take() {
            offset += write_block(&mut out, &mut dictionary, offset, k, &block)?;
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((dictionary, num_postings))
    }

    fn publish(&self) -> Result<()> {
        let tmp = self.paths.current_tmp();
        let mut f = File::create(&tmp)?;
        f.write_all(generation_name(self.generation).as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, self.paths.current())?;
        Ok(())
    }

    // The predecessor stays on disk: a running server may still be reading it.
    fn prune(&self) {
        let entries = match fs::read_dir(&self.paths.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "could not list index root for pruning");
                return;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(generation) = name.to_str().and_then(parse_generation) else { continue };
            if generation + 1 < self.generation {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!(generation, error = %e, "could not remove old index generation");
                }
            }
        }
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.db.take();
        let dir = self.paths.generation(self.generation);
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!(generation = self.generation, "discarded unpublished index generation"),
            Err(e) => warn!(generation = self.generation, error = %e, "could not discard unpublished generation"),
        }
    }
}

struct Published {
    meta: MetaFile,
    dictionary: Dictionary,
    postings_file: PathBuf,
}

/// Read-only view of the generation that was published when it was opened.
///
/// Only the dictionary is held in memory. Each lookup opens `postings.bin`
/// read-only for its own duration, so any number of readers, in this or other
/// processes, can share a generation without locking.
#[derive(Clone, Default)]
pub struct IndexReader {
    published: Option<Arc<Published>>,
}

impl IndexReader {
    /// Open the published generation under `root`. An index that was never
    /// built opens as empty.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let paths = IndexPaths::new(root);
        let Some(generation) = paths.published_generation()? else {
            debug!(root = %paths.root.display(), "no published index; serving empty results");
            return Ok(Self::empty());
        };
        let meta = load_meta(&paths, generation)?;
        let dictionary = load_dictionary(&paths, generation)?;
        let postings_file = paths.postings_file(generation);
        if !postings_file.is_file() {
            return Err(IndexError::Corrupt(format!("missing postings for {}", generation_name(generation))));
        }
        info!(generation, num_keywords = dictionary.len(), "opened published index");
        Ok(Self { published: Some(Arc::new(Published { meta, dictionary, postings_file })) })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> Option<u64> {
        self.published.as_ref().map(|p| p.meta.generation)
    }

    pub fn meta(&self) -> Option<&MetaFile> {
        self.published.as_ref().map(|p| &p.meta)
    }

    /// All postings whose keyword equals `keyword` exactly, ordered by url.
    pub fn postings(&self, keyword: &str) -> Result<Vec<Posting>> {
        let Some(published) = &self.published else { return Ok(Vec::new()) };
        let Some(block) = published.dictionary.get(keyword) else { return Ok(Vec::new()) };
        let mut f = File::open(&published.postings_file)?;
        read_block(&mut f, keyword, *block)
    }

    /// Write every posting as `keyword\turl\tfrequency`, sorted by `(keyword, url)`.
    pub fn export<W: Write>(&self, mut out: W) -> Result<u64> {
        let Some(published) = &self.published else { return Ok(0) };
        let mut f = File::open(&published.postings_file)?;
        let mut rows = 0u64;
        for (keyword, block) in &published.dictionary {
            for p in read_block(&mut f, keyword, *block)? {
                writeln!(out, "{}\t{}\t{}", p.keyword, p.url, p.frequency)?;
                rows += 1;
            }
        }
        out.flush()?;
        Ok(rows)
    }
}

fn write_block<W: Write>(
    out: &mut W,
    dictionary: &mut Dictionary,
    offset: u64,
    keyword: String,
    block: &[(String, Frequency)],
) -> Result<u64> {
    let bytes = bincode::serialize(block)?;
    out.write_all(&bytes)?;
    let len = bytes.len() as u64;
    dictionary.insert(keyword, BlockRef { offset, len });
    Ok(len)
}

fn read_block(f: &mut File, keyword: &str, block: BlockRef) -> Result<Vec<Posting>> {
    let len = usize::try_from(block.len)
        .map_err(|_| IndexError::Corrupt(format!("postings block for {keyword:?} too large")))?;
    let mut buf = vec![0u8; len];
    f.seek(SeekFrom::Start(block.offset))?;
    f.read_exact(&mut buf)?;
    let entries: Vec<(String, Frequency)> = bincode::deserialize(&buf)?;
    Ok(entries
        .into_iter()
        .map(|(url, frequency)| Posting { keyword: keyword.to_string(), url, frequency })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn counts(pairs: &[(&str, Frequency)]) -> BTreeMap<String, Frequency> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn unbuilt_index_reads_empty() {
        let dir = tempdir().unwrap();
        let reader = IndexReader::open(dir.path()).unwrap();
        assert_eq!(reader.generation(), None);
        assert!(reader.postings("cat").unwrap().is_empty());
    }

    #[test]
    fn commit_publishes_and_counts() {
        let dir = tempdir().unwrap();
        let mut writer = IndexWriter::create(dir.path()).unwrap();
        writer.put_document("a.html", &counts(&[("cat", 1), ("fish", 2)])).unwrap();
        writer.put_document("b.html", &counts(&[("cat", 1), ("dog", 1)])).unwrap();
        let meta = writer.commit().unwrap();
        assert_eq!(meta.generation, 1);
        assert_eq!(meta.num_documents, 2);
        assert_eq!(meta.num_keywords, 3);
        assert_eq!(meta.num_postings, 4);
        assert!(!meta.created_at.is_empty());

        let reader = IndexReader::open(dir.path()).unwrap();
        let cats = reader.postings("cat").unwrap();
        assert_eq!(cats.iter().map(|p| p.url.as_str()).collect::<Vec<_>>(), vec!["a.html", "b.html"]);
        assert_eq!(reader.meta().unwrap(), &meta);
        assert!(!IndexPaths::new(dir.path()).build_db(1).exists());
    }

    #[test]
    fn keyword_lookup_is_exact_not_prefix() {
        let dir = tempdir().unwrap();
        let mut writer = IndexWriter::create(dir.path()).unwrap();
        writer.put_document("a", &counts(&[("cat", 1), ("catalog", 4)])).unwrap();
        writer.commit().unwrap();
        let reader = IndexReader::open(dir.path()).unwrap();
        let cats = reader.postings("cat").unwrap();
        assert_eq!(cats, vec![Posting { keyword: "cat".into(), url: "a".into(), frequency: 1 }]);
        assert!(reader.postings("ca").unwrap().is_empty());
    }

    #[test]
    fn repeated_document_replaces_postings() {
        let dir = tempdir().unwrap();
        let mut writer = IndexWriter::create(dir.path()).unwrap();
        writer.put_document("a", &counts(&[("old", 3), ("cat", 1)])).unwrap();
        writer.put_document("a", &counts(&[("cat", 2)])).unwrap();
        writer.commit().unwrap();
        let reader = IndexReader::open(dir.path()).unwrap();
        let mut out = Vec::new();
        reader.export(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "cat\ta\t2\n");
    }

    #[test]
    fn many_readers_share_one_generation() {
        let dir = tempdir().unwrap();
        let mut writer = IndexWriter::create(dir.path()).unwrap();
        writer.put_document("a", &counts(&[("cat", 2)])).unwrap();
        writer.put_document("b", &counts(&[("cat", 1), ("dog", 5)])).unwrap();
        writer.commit().unwrap();

        let first = IndexReader::open(dir.path()).unwrap();
        let second = IndexReader::open(dir.path()).unwrap();
        assert_eq!(first.postings("cat").unwrap(), second.postings("cat").unwrap());

        let mut a = Vec::new();
        let mut b = Vec::new();
        first.export(&mut a).unwrap();
        second.export(&mut b).unwrap();
        assert_eq!(a, b);
        assert_eq!(String::from_utf8(a).unwrap(), "cat\ta\t2\ncat\tb\t1\ndog\tb\t5\n");
    }

    #[test]
    fn missing_postings_file_is_a_read_error() {
        let dir = tempdir().unwrap();
        let mut writer = IndexWriter::create(dir.path()).unwrap();
        writer.put_document("a", &counts(&[("cat", 2)])).unwrap();
        writer.commit().unwrap();
        let reader = IndexReader::open(dir.path()).unwrap();

        fs::remove_file(IndexPaths::new(dir.path()).postings_file(1)).unwrap();
        assert!(matches!(reader.postings("cat"), Err(IndexError::Io(_))));
        // unknown keywords never touch the postings file
        assert!(reader.postings("dog").unwrap().is_empty());
    }

    #[test]
    fn dropped_writer_publishes_nothing() {
        let dir = tempdir().unwrap();
        {
            let mut writer = IndexWriter::create(dir.path()).unwrap();
            writer.put_document("a", &counts(&[("cat", 1)])).unwrap();
            assert!(IndexPaths::new(dir.path()).generation(1).exists());
        }
        assert!(!IndexPaths::new(dir.path()).generation(1).exists());
        assert_eq!(IndexPaths::new(dir.path()).published_generation().unwrap(), None);
    }

    #[test]
    fn commit_keeps_predecessor_and_prunes_older() {
        let dir = tempdir().unwrap();
        for _ in 0..3 {
            let mut writer = IndexWriter::create(dir.path()).unwrap();
            writer.put_document("a", &counts(&[("cat", 1)])).unwrap();
            writer.commit().unwrap();
        }
        let paths = IndexPaths::new(dir.path());
        assert_eq!(paths.published_generation().unwrap(), Some(3));
        assert!(paths.generation(3).exists());
        assert!(paths.generation(2).exists());
        assert!(!paths.generation(1).exists());
    }

    #[test]
    fn bad_pointer_is_reported_as_corrupt() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CURRENT), "nonsense").unwrap();
        assert!(matches!(IndexReader::open(dir.path()), Err(IndexError::Corrupt(_))));
    }
}
