use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Storage seam used by the key store and the request tracker.
///
/// Everything that persists provisioning state goes through this trait so
/// tests can run against [`VirtualFileSystem`] and inject write failures.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Default, Clone)]
pub struct RealFileSystem;

impl RealFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, data)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// In-memory filesystem for tests.
///
/// Paths registered with [`VirtualFileSystem::mark_read_only`] reject
/// writes, renames onto them and removals with `PermissionDenied`.
#[derive(Debug, Clone)]
pub struct VirtualFileSystem {
    inner: Arc<Mutex<VirtualFsInner>>,
}

#[derive(Debug, Default)]
struct VirtualFsInner {
    nodes: HashMap<PathBuf, VNode>,
    read_only: HashSet<PathBuf>,
}

#[derive(Debug, Clone)]
enum VNode {
    File(Vec<u8>),
    Dir,
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        let mut inner = VirtualFsInner::default();
        inner.nodes.insert(PathBuf::from("/"), VNode::Dir);
        VirtualFileSystem {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn mark_read_only(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_only.insert(Self::normalize(path));
    }

    pub fn clear_read_only(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_only.remove(&Self::normalize(path));
    }

    fn normalize(path: &Path) -> PathBuf {
        let mut components = Vec::new();
        for comp in path.components() {
            match comp {
                Component::RootDir => {
                    components.clear();
                    components.push(PathBuf::from("/"));
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    components.pop();
                }
                Component::Normal(c) => {
                    let mut p = components.last().cloned().unwrap_or_else(|| PathBuf::from("/"));
                    p.push(c);
                    components.push(p);
                }
                Component::Prefix(_) => {}
            }
        }
        components.last().cloned().unwrap_or_else(|| PathBuf::from("/"))
    }

    fn ensure_parents(inner: &mut VirtualFsInner, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            inner
                .nodes
                .entry(ancestor.to_path_buf())
                .or_insert(VNode::Dir);
        }
    }

    fn reject_read_only(inner: &VirtualFsInner, norm: &Path) -> io::Result<()> {
        if inner.read_only.contains(norm) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is read-only", norm.display()),
            ));
        }
        Ok(())
    }
}

impl FileSystem for VirtualFileSystem {
    fn exists(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.nodes.contains_key(&Self::normalize(path))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let norm = Self::normalize(path);
        match inner.nodes.get(&norm) {
            Some(VNode::File(data)) => Ok(data.clone()),
            Some(VNode::Dir) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is a directory", norm.display()),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", norm.display()),
            )),
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let norm = Self::normalize(path);
        Self::reject_read_only(&inner, &norm)?;
        Self::ensure_parents(&mut inner, &norm);
        inner.nodes.insert(norm, VNode::File(data.to_vec()));
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let norm = Self::normalize(path);
        Self::ensure_parents(&mut inner, &norm);
        inner.nodes.entry(norm).or_insert(VNode::Dir);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let from_norm = Self::normalize(from);
        let to_norm = Self::normalize(to);

        if from_norm == to_norm {
            return Ok(());
        }
        Self::reject_read_only(&inner, &to_norm)?;
        Self::ensure_parents(&mut inner, &to_norm);

        let node = inner.nodes.remove(&from_norm).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", from_norm.display()),
            )
        })?;
        inner.nodes.insert(to_norm, node);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let norm = Self::normalize(path);
        Self::reject_read_only(&inner, &norm)?;
        match inner.nodes.get(&norm) {
            Some(VNode::File(_)) => {}
            Some(VNode::Dir) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} is a directory", norm.display()),
                ))
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", norm.display()),
                ))
            }
        }
        inner.nodes.remove(&norm);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
