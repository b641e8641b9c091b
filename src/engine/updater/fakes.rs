//! In-memory collaborators for exercising the orchestrator without network or disk.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::transfer::{ArtifactPair, ArtifactRequest, ArtifactTransfer, TransferError};
use crate::engine::remote::{Method, RemoteCall, RemoteError, RemoteRequest, RemoteResponse};

/// A call as the fake saw it
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RecordedCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct Route {
    method: Method,
    path: String,
    replies: VecDeque<Result<RemoteResponse, RemoteError>>,
}

/// Replies are queued per route (method + URL suffix) and consumed in order;
/// the last reply repeats forever. Unrouted calls get a 404 with an empty body.
#[derive(Default)]
pub struct ScriptedRemote {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, method: Method, path: &str, status: u16, body: Value) -> Self {
        self.push(method, path, Ok(RemoteResponse::new(status, body)))
    }

    pub fn reply_error(self, method: Method, path: &str, error: RemoteError) -> Self {
        self.push(method, path, Err(error))
    }

    fn push(self, method: Method, path: &str, reply: Result<RemoteResponse, RemoteError>) -> Self {
        {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            match routes.iter_mut().find(|r| r.method == method && r.path == path) {
                Some(route) => route.replies.push_back(reply),
                None => routes.push(Route {
                    method,
                    path: path.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Calls whose URL ends with `path`, any method
    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|call| call.url.ends_with(path))
            .count()
    }
}

impl RemoteCall for ScriptedRemote {
    fn call(&self, request: &RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                method: request.method.clone(),
                url: request.url.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
            });

        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == request.method && request.url.ends_with(&r.path))
        else {
            return Ok(RemoteResponse::new(404, json!({})));
        };

        if route.replies.len() > 1 {
            route.replies.pop_front().unwrap_or_else(|| Ok(RemoteResponse::new(404, json!({}))))
        } else {
            route
                .replies
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(RemoteResponse::new(404, json!({}))))
        }
    }
}

/// Where a `MemoryTransfer` should break
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Prepare,
    Fetch,
    /// Fetch reports success but the signature never lands
    Verify,
}

/// Staging directory held in memory
pub struct MemoryTransfer {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    payload: Vec<u8>,
    signature: Vec<u8>,
    fail_at: Option<FailAt>,
    prepare_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    verify_calls: AtomicUsize,
}

impl MemoryTransfer {
    pub fn new() -> Self {
        Self::with_contents(b"ruleset payload".to_vec(), b"detached signature".to_vec())
    }

    pub fn with_contents(payload: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            payload,
            signature,
            fail_at: None,
            prepare_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(fail_at: FailAt) -> Self {
        Self {
            fail_at: Some(fail_at),
            ..Self::new()
        }
    }

    /// Leave a file behind, as a previous failed run would
    pub fn seed(&self, name: &str, contents: &[u8]) {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), contents.to_vec());
    }

    pub fn staged_files(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn prepare_calls(&self) -> usize {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.prepare_calls() + self.fetch_calls() + self.verify_calls()
    }
}

impl Default for MemoryTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactTransfer for MemoryTransfer {
    fn prepare(&self, staging_dir: &Path) -> Result<(), TransferError> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(FailAt::Prepare) {
            return Err(TransferError::StagingDir {
                path: staging_dir.to_path_buf(),
                detail: "Permission denied (os error 13)".to_string(),
            });
        }
        self.files.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    fn fetch(&self, request: &ArtifactRequest, staging_dir: &Path) -> Result<ArtifactPair, TransferError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(FailAt::Fetch) {
            return Err(TransferError::Download {
                file: request.payload_file.clone(),
                detail: "HTTP 401 Unauthorized".to_string(),
            });
        }
        for (name, contents) in [
            (&request.payload_file, &self.payload),
            (&request.signature_file, &self.signature),
        ] {
            if contents.is_empty() {
                return Err(TransferError::Download {
                    file: name.clone(),
                    detail: "empty response body".to_string(),
                });
            }
        }

        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.insert(request.payload_file.clone(), self.payload.clone());
        if self.fail_at != Some(FailAt::Verify) {
            files.insert(request.signature_file.clone(), self.signature.clone());
        }

        Ok(ArtifactPair {
            payload_path: staging_dir.join(&request.payload_file),
            signature_path: staging_dir.join(&request.signature_file),
            payload_bytes: self.payload.len() as u64,
            signature_bytes: self.signature.len() as u64,
            payload_sha256: hex::encode(Sha256::digest(&self.payload)),
        })
    }

    fn verify(&self, staging_dir: &Path, pair: &ArtifactPair) -> Result<(), TransferError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        for path in [&pair.payload_path, &pair.signature_path] {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match files.get(&name) {
                Some(contents) if !contents.is_empty() => {}
                Some(_) => return Err(TransferError::Incomplete(format!("{} is empty", name))),
                None => {
                    return Err(TransferError::Incomplete(format!(
                        "{} missing from {}",
                        name,
                        staging_dir.display()
                    )))
                }
            }
        }
        Ok(())
    }
}
