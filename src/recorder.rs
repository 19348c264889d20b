//! Append-only, request-number-ordered journal writer.
//!
//! Requests are dispatched concurrently but the journal must read as if they
//! ran one after another. The writer keeps a current recording request
//! counter: texts for the current request go straight to disk, texts for
//! later requests wait in a per-request cache until every earlier request
//! has completed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};

pub struct RecordFileWriter {
    file: File,
    path: PathBuf,
    current_request: u64,
    cache: BTreeMap<u64, String>,
    completed: BTreeSet<u64>,
    /// Everything written since the last truncation point, kept so
    /// `rerecord` can replay it with a substitution applied.
    since_truncation: String,
    truncation_offset: u64,
}

impl RecordFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| Error::RecordJournal {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            current_request: 1,
            cache: BTreeMap::new(),
            completed: BTreeSet::new(),
            since_truncation: String::new(),
            truncation_offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `text` on behalf of request `request_number`.
    ///
    /// Texts for the current recording request hit the disk immediately, in
    /// call order; texts for later requests are buffered until their turn.
    pub fn record(&mut self, text: &str, request_number: u64) {
        if request_number == self.current_request {
            self.write_now(text);
        } else if request_number > self.current_request {
            self.cache.entry(request_number).or_default().push_str(text);
        } else {
            // A completed request is still writing: preserve the bytes, the
            // strict ordering guarantee is already lost for them.
            warn!(
                "Request {request_number} recorded after request {} became current",
                self.current_request
            );
            self.write_now(text);
        }
    }

    /// Mark request `request_number` finished. When the current request
    /// finishes, the writer drains the cache of every already-finished
    /// follower in ascending order.
    pub fn request_complete(&mut self, request_number: u64) {
        debug!("Request {request_number} complete");
        self.completed.insert(request_number);
        while self.completed.remove(&self.current_request) {
            self.current_request += 1;
            if let Some(text) = self.cache.remove(&self.current_request) {
                self.write_now(&text);
            }
        }
    }

    /// Rewrite everything since the last truncation point, substituting
    /// `old` with `new`. Only safe in single-threaded start-up windows: the
    /// per-request cache must be empty.
    pub fn rerecord(&mut self, old: &str, new: &str) -> Result<()> {
        debug_assert!(self.cache.is_empty(), "rerecord with buffered requests");
        let replayed = self.since_truncation.replace(old, new);
        self.file.set_len(self.truncation_offset)?;
        self.file.seek(SeekFrom::Start(self.truncation_offset))?;
        self.file.write_all(replayed.as_bytes())?;
        self.file.flush()?;
        self.since_truncation = replayed;
        Ok(())
    }

    /// Establish a new truncation point at the current end of the journal.
    pub fn mark_truncation_point(&mut self) -> Result<()> {
        self.truncation_offset = self.file.seek(SeekFrom::End(0))?;
        self.since_truncation.clear();
        Ok(())
    }

    fn write_now(&mut self, text: &str) {
        if let Err(e) = self.file.write_all(text.as_bytes()).and_then(|()| self.file.flush()) {
            warn!("Failed to write record journal {}: {e}", self.path.display());
            return;
        }
        self.since_truncation.push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(writer: &RecordFileWriter) -> String {
        std::fs::read_to_string(writer.path()).unwrap()
    }

    fn new_writer(dir: &tempfile::TempDir) -> RecordFileWriter {
        RecordFileWriter::create(&dir.path().join("traffic.journal")).unwrap()
    }

    #[test]
    fn in_order_requests_stream_straight_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = new_writer(&dir);
        writer.record("<-CLI:a\n", 1);
        writer.record("->SRV:b\n", 1);
        writer.request_complete(1);
        writer.record("<-CLI:c\n", 2);
        writer.request_complete(2);
        assert_eq!(read(&writer), "<-CLI:a\n->SRV:b\n<-CLI:c\n");
    }

    #[test]
    fn later_requests_wait_for_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = new_writer(&dir);
        // request 2 finishes first; its bytes must still come second
        writer.record("<-CLI:second\n", 2);
        writer.request_complete(2);
        assert_eq!(read(&writer), "");
        writer.record("<-CLI:first\n", 1);
        writer.request_complete(1);
        assert_eq!(read(&writer), "<-CLI:first\n<-CLI:second\n");
    }

    #[test]
    fn completion_cascades_through_finished_followers() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = new_writer(&dir);
        writer.record("three\n", 3);
        writer.record("two\n", 2);
        writer.request_complete(3);
        writer.request_complete(2);
        writer.record("one\n", 1);
        writer.request_complete(1);
        assert_eq!(read(&writer), "one\ntwo\nthree\n");
    }

    #[test]
    fn current_request_can_keep_writing_after_cache_drain() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = new_writer(&dir);
        writer.record("2a\n", 2);
        writer.request_complete(1);
        // request 2 is now current: buffered text already flushed, direct
        // writes continue in order
        writer.record("2b\n", 2);
        writer.request_complete(2);
        assert_eq!(read(&writer), "2a\n2b\n");
    }

    #[test]
    fn rerecord_substitutes_since_the_truncation_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = new_writer(&dir);
        writer.record("<-CLI:keep id_0\n", 1);
        writer.request_complete(1);
        writer.mark_truncation_point().unwrap();
        writer.record("<-CLI:call id_0\n", 2);
        writer.request_complete(2);
        writer.rerecord("id_0", "id_1").unwrap();
        assert_eq!(read(&writer), "<-CLI:keep id_0\n<-CLI:call id_1\n");
    }
}
