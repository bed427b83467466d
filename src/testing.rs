//! In-process fakes for the external collaborators.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::{RecordError, SourceError};
use crate::import::{RecordOutcome, RecordStore};
use crate::model::ImportConfiguration;
use crate::source::RemoteFetcher;

#[derive(Default)]
pub struct FakeFetcher {
    responses: HashMap<String, Result<Vec<u8>, &'static str>>,
    pub fetches: Cell<usize>,
}

impl FakeFetcher {
    pub fn with_body(location: &str, body: &str) -> Self {
        let mut fetcher = Self::default();
        fetcher
            .responses
            .insert(location.to_string(), Ok(body.as_bytes().to_vec()));
        fetcher
    }

    pub fn failing(location: &str, kind: &'static str) -> Self {
        let mut fetcher = Self::default();
        fetcher.responses.insert(location.to_string(), Err(kind));
        fetcher
    }

    fn lookup(&self, location: &str) -> Result<&Vec<u8>, SourceError> {
        match self.responses.get(location) {
            Some(Ok(body)) => Ok(body),
            Some(Err("auth")) => Err(SourceError::AuthFailed(location.to_string())),
            Some(Err("missing")) => Err(SourceError::NotFound(location.to_string())),
            Some(Err(_)) | None => Err(SourceError::Unreachable(location.to_string())),
        }
    }
}

impl RemoteFetcher for FakeFetcher {
    fn fetch(&self, location: &str, _credentials: Option<&str>) -> Result<Vec<u8>, SourceError> {
        self.fetches.set(self.fetches.get() + 1);
        self.lookup(location).cloned()
    }

    fn probe(&self, location: &str, _credentials: Option<&str>) -> Result<(), SourceError> {
        self.lookup(location).map(|_| ())
    }
}

/// Record store that keeps everything in memory and can be told to fail on
/// the n-th write.
#[derive(Default)]
pub struct MemoryRecords {
    pub written: RefCell<Vec<BTreeMap<String, String>>>,
    pub fail_on_call: Option<usize>,
    calls: Cell<usize>,
}

impl MemoryRecords {
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }
}

impl RecordStore for MemoryRecords {
    fn create_or_update(
        &self,
        kind: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<RecordOutcome, RecordError> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        if self.fail_on_call == Some(call) {
            return Err(RecordError {
                kind: kind.to_string(),
                message: "database went away".to_string(),
            });
        }

        let mut written = self.written.borrow_mut();
        written.push(fields.clone());
        Ok(RecordOutcome {
            id: written.len() as i64,
            created: true,
        })
    }
}

pub fn write_file(root: &Path, name: &str, body: &str) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("fixture directory should be creatable");
    }
    fs::write(path, body).expect("fixture file should be writable");
}

pub fn local_config(root: &Path, file: &str) -> ImportConfiguration {
    ImportConfiguration {
        local_root: root.to_path_buf(),
        local_path: file.to_string(),
        required_fields: vec!["title".to_string()],
        known_fields: vec![
            "title".to_string(),
            "content".to_string(),
            "slug".to_string(),
        ],
        ..ImportConfiguration::default()
    }
}
