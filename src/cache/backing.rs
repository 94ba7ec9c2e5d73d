//! Where cached content comes from.

use super::CacheError;
use bytes::Bytes;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// Marker that changes whenever the underlying resource changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Identity {
    pub inode: u64,
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub identity: Identity,
    pub kind: Kind,
}

/// Synchronous source of cacheable resources, addressed by request path.
pub trait Backing: Send + Sync {
    fn metadata(&self, path: &str) -> Result<Metadata, CacheError>;

    fn read(&self, path: &str) -> Result<Bytes, CacheError>;
}

/// Serves files below a document root.
#[derive(Debug, Clone)]
pub struct FsBacking {
    root: PathBuf,
}

impl FsBacking {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a request path onto the document root. Anything that could climb
    /// out of the root is refused.
    fn resolve(&self, path: &str) -> Result<PathBuf, CacheError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(CacheError::Forbidden),
            }
        }
        Ok(resolved)
    }
}

fn map_io(e: io::Error) -> CacheError {
    match e.kind() {
        io::ErrorKind::NotFound => CacheError::NotFound,
        io::ErrorKind::PermissionDenied => CacheError::Forbidden,
        _ => CacheError::Io(e),
    }
}

impl Backing for FsBacking {
    fn metadata(&self, path: &str) -> Result<Metadata, CacheError> {
        let meta = fs::metadata(self.resolve(path)?).map_err(map_io)?;
        Ok(Metadata {
            identity: Identity {
                inode: meta.ino(),
                size: meta.size(),
                mtime: meta.mtime(),
            },
            kind: if meta.is_dir() {
                Kind::Directory
            } else {
                Kind::File
            },
        })
    }

    fn read(&self, path: &str) -> Result<Bytes, CacheError> {
        let data = fs::read(self.resolve(path)?).map_err(map_io)?;
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryBacking;

#[cfg(test)]
mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory backing with read accounting.
    #[derive(Default)]
    pub(crate) struct MemoryBacking {
        files: Mutex<HashMap<String, (Identity, Bytes)>>,
        next_inode: AtomicUsize,
        reads: AtomicUsize,
    }

    impl MemoryBacking {
        /// Create or replace a file; every call yields a new identity.
        pub(crate) fn put(&self, path: &str, body: &[u8], mtime: i64) {
            let inode = self.next_inode.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            let identity = Identity {
                inode,
                size: body.len() as u64,
                mtime,
            };
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), (identity, Bytes::copy_from_slice(body)));
        }

        pub(crate) fn delete(&self, path: &str) {
            self.files.lock().unwrap().remove(path);
        }

        pub(crate) fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl Backing for MemoryBacking {
        fn metadata(&self, path: &str) -> Result<Metadata, CacheError> {
            let files = self.files.lock().unwrap();
            let (identity, _) = files.get(path).ok_or(CacheError::NotFound)?;
            Ok(Metadata {
                identity: *identity,
                kind: Kind::File,
            })
        }

        fn read(&self, path: &str) -> Result<Bytes, CacheError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let files = self.files.lock().unwrap();
            files
                .get(path)
                .map(|(_, body)| body.clone())
                .ok_or(CacheError::NotFound)
        }
    }
}
