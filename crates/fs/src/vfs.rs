//! Node tree, path resolution, and the `create`/`mount`/`symlink`/`link`/
//! `unlink`/`pathname` operations built on top of it.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::sync::{RwLock, SpinLock};

use crate::resource::ResourceRef;
use crate::stat::Stat;

/// Bound on symlink resolution depth, guarding against `ELOOP` cycles.
pub const MAX_SYMLINK_DEPTH: usize = 40;

/// The kind of thing a [`Node`] names, independent of its backing
/// [`crate::resource::Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link (target stored on the node itself).
    Symlink,
    /// A device node (character or block), resolved to a driver resource.
    Device,
}

/// A filesystem implementation, consulted by [`Vfs::create`] and
/// [`Vfs::mount`] for the operations it owns.
pub trait FileSystem: Send + Sync {
    /// Human-readable name this filesystem is registered under (`"tmpfs"`,
    /// `"devfs"`).
    fn name(&self) -> &str;

    /// Creates a new child named `name` under `parent`, returning the new
    /// node.
    fn create(&self, parent: &Arc<Node>, name: &str, kind: NodeKind) -> Result<Arc<Node>, Errno>;

    /// Mounts this filesystem at `target_parent/basename`, given the
    /// resolved source node (ignored by pseudo-filesystems like tmpfs that
    /// invent a fresh root). Returns the new mount's root node.
    fn mount(
        &self,
        target_parent: &Arc<Node>,
        basename: &str,
        source: Option<&Arc<Node>>,
    ) -> Result<Arc<Node>, Errno>;
}

struct NodeInner {
    children: BTreeMap<String, Arc<Node>>,
    /// Set when this node is a mountpoint; lookups are redirected to the
    /// mounted filesystem's root.
    mountpoint: Option<Arc<Node>>,
}

/// One entry in the VFS tree.
pub struct Node {
    /// This node's name within its parent (empty for the root).
    pub name: String,
    /// The kind of entry this node names.
    pub kind: NodeKind,
    /// Parent node; `None` only for the VFS root.
    parent: Option<Weak<Node>>,
    /// For `.`/`..` dot-entries: the node this entry actually refers to,
    /// consulted before `mountpoint`/`symlink_target`.
    pub redirect: Option<Arc<Node>>,
    /// For symlinks: the textual target, resolved relative to this node's
    /// parent.
    pub symlink_target: Option<String>,
    /// The filesystem that owns this node (answers `create`/further
    /// `mount` calls scoped to it).
    pub filesystem: Arc<dyn FileSystem>,
    /// The underlying object this node names.
    pub resource: ResourceRef,
    inner: RwLock<NodeInner>,
}

impl Node {
    /// Creates a new, childless node.
    pub fn new(
        name: String,
        kind: NodeKind,
        parent: Option<Weak<Node>>,
        filesystem: Arc<dyn FileSystem>,
        resource: ResourceRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            parent,
            redirect: None,
            symlink_target: None,
            filesystem,
            resource,
            inner: RwLock::new(NodeInner {
                children: BTreeMap::new(),
                mountpoint: None,
            }),
        })
    }

    /// Returns this node's parent, or itself if it is the VFS root.
    pub fn parent_or_self(self: &Arc<Self>) -> Arc<Self> {
        self.parent
            .as_ref()
            .and_then(Weak::upgrade)
            .unwrap_or_else(|| self.clone())
    }

    fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.inner.read().children.get(name).cloned()
    }

    pub(crate) fn insert_child(&self, name: String, node: Arc<Node>) {
        self.inner.write().children.insert(name, node);
    }

    fn remove_child(&self, name: &str) -> Option<Arc<Node>> {
        self.inner.write().children.remove(name)
    }

    /// Returns the node this one mounts to, if it is a mountpoint.
    pub fn mountpoint(&self) -> Option<Arc<Node>> {
        self.inner.read().mountpoint.clone()
    }

    /// Sets this node as a mountpoint pointing at `root`.
    pub fn set_mountpoint(&self, root: Arc<Node>) {
        self.inner.write().mountpoint = Some(root);
    }

    /// Returns this node's metadata, delegating to its resource.
    pub fn stat(&self) -> Result<Stat, Errno> {
        self.resource.stat()
    }

    /// Snapshots this directory's entries as `(name, kind)` pairs, for
    /// `readdir`.
    pub fn children(&self) -> Vec<(String, NodeKind)> {
        self.inner
            .read()
            .children
            .iter()
            .map(|(name, node)| (name.clone(), node.kind))
            .collect()
    }
}

/// Registry of filesystems by name, plus the tree root. One instance per
/// kernel.
pub struct Vfs {
    root: Arc<Node>,
    filesystems: SpinLock<BTreeMap<String, Arc<dyn FileSystem>>>,
}

impl Vfs {
    /// Creates a VFS with `root` as its top-level node (typically a fresh
    /// tmpfs root created by the caller before registering any
    /// filesystems).
    pub fn new(root: Arc<Node>) -> Self {
        Self {
            root,
            filesystems: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Returns the VFS root node.
    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    /// Registers a filesystem implementation under its own name, so
    /// `mount` can later look it up by name.
    pub fn register_filesystem(&self, fs: Arc<dyn FileSystem>) {
        self.filesystems.lock().insert(fs.name().to_string(), fs);
    }

    fn lookup_filesystem(&self, name: &str) -> Result<Arc<dyn FileSystem>, Errno> {
        self.filesystems
            .lock()
            .get(name)
            .cloned()
            .ok_or(Errno::ENoDev)
    }

    /// Creates the `.` and `..` dot-entries for a freshly created
    /// directory, whose `redirect` is set rather than the entries being
    /// real children. `..` on a filesystem root is handled by the caller
    /// overriding the redirect target with the parent of the mountpoint.
    pub fn create_dotentries(&self, dir: &Arc<Node>, parent: &Arc<Node>) {
        let dot = Node::new(
            ".".to_string(),
            NodeKind::Directory,
            Some(Arc::downgrade(dir)),
            dir.filesystem.clone(),
            dir.resource.clone(),
        );
        let dotdot = Node::new(
            "..".to_string(),
            NodeKind::Directory,
            Some(Arc::downgrade(dir)),
            parent.filesystem.clone(),
            parent.resource.clone(),
        );
        dir.insert_child(".".to_string(), Self::with_redirect(dot, dir.clone()));
        dir.insert_child("..".to_string(), Self::with_redirect(dotdot, parent.clone()));
    }

    fn with_redirect(template: Arc<Node>, target: Arc<Node>) -> Arc<Node> {
        Arc::new(Node {
            name: template.name.clone(),
            kind: template.kind,
            parent: template.parent.clone(),
            redirect: Some(target),
            symlink_target: None,
            filesystem: template.filesystem.clone(),
            resource: template.resource.clone(),
            inner: RwLock::new(NodeInner {
                children: BTreeMap::new(),
                mountpoint: None,
            }),
        })
    }

    /// Applies one step of node reduction: follow `redirect` (dot-entries),
    /// then `mountpoint`, then (if `follow_symlink`) `symlink_target`
    /// recursively, re-rooting the resolver at the link's own parent.
    /// Bounded by [`MAX_SYMLINK_DEPTH`] to turn symlink cycles into
    /// `ELOOP`.
    pub fn reduce_node(&self, node: Arc<Node>, follow_symlink: bool) -> Result<Arc<Node>, Errno> {
        let mut current = node;
        let mut depth = 0;
        loop {
            if let Some(redirect) = current.redirect.clone() {
                current = redirect;
                continue;
            }
            if let Some(mount_root) = current.mountpoint() {
                current = mount_root;
                continue;
            }
            if follow_symlink && current.kind == NodeKind::Symlink {
                depth += 1;
                if depth > MAX_SYMLINK_DEPTH {
                    return Err(Errno::ELoop);
                }
                let target = current
                    .symlink_target
                    .clone()
                    .ok_or(Errno::EInval)?;
                let parent = current.parent_or_self();
                current = self.resolve(&target, &parent, true)?;
                continue;
            }
            return Ok(current);
        }
    }

    /// Resolves `path` starting at `vfs_root` for absolute paths, or at
    /// `cwd` for relative ones.
    pub fn resolve(&self, path: &str, cwd: &Arc<Node>, follow_symlink: bool) -> Result<Arc<Node>, Errno> {
        if path.len() > 4096 {
            return Err(Errno::ENameTooLong);
        }
        let mut current = if path.starts_with('/') {
            self.root.clone()
        } else {
            cwd.clone()
        };
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for (i, component) in components.iter().enumerate() {
            current = self.reduce_node(current, true)?;
            let child = current.child(component).ok_or(Errno::ENoEnt)?;
            let is_last = i + 1 == components.len();
            current = self.reduce_node(child, follow_symlink || !is_last)?;
        }
        Ok(current)
    }

    /// Creates a new entry named `name` under `parent`, delegating to
    /// `parent`'s owning filesystem.
    pub fn create(&self, parent: &Arc<Node>, name: &str, kind: NodeKind) -> Result<Arc<Node>, Errno> {
        let parent = self.reduce_node(parent.clone(), true)?;
        if parent.kind != NodeKind::Directory {
            return Err(Errno::ENotDir);
        }
        if parent.child(name).is_some() {
            return Err(Errno::EExist);
        }
        let child = parent.filesystem.create(&parent, name, kind)?;
        parent.insert_child(name.to_string(), child.clone());
        Ok(child)
    }

    /// Mounts the filesystem registered as `fs_name` at `target`,
    /// resolved under `parent`. `source` must resolve to a directory.
    pub fn mount(
        &self,
        parent: &Arc<Node>,
        source: &str,
        target: &str,
        fs_name: &str,
    ) -> Result<(), Errno> {
        let fs = self.lookup_filesystem(fs_name)?;
        let source_node = if source.is_empty() {
            None
        } else {
            let node = self.resolve(source, parent, true)?;
            if node.kind != NodeKind::Directory {
                return Err(Errno::ENotDir);
            }
            Some(node)
        };
        let target_node = self.resolve(target, parent, true)?;
        let target_parent = target_node.parent_or_self();
        let basename = target_node.name.clone();
        let new_root = fs.mount(&target_parent, &basename, source_node.as_ref())?;
        target_node.set_mountpoint(new_root.clone());
        self.create_dotentries(&new_root, &target_parent);
        Ok(())
    }

    /// Creates a symlink named `name` under `parent` pointing at `target`.
    ///
    /// Symlinks carry no filesystem-specific backing state, so this
    /// constructs the node directly instead of delegating to
    /// `parent.filesystem.create` the way regular files and directories do.
    pub fn symlink(&self, parent: &Arc<Node>, name: &str, target: &str) -> Result<Arc<Node>, Errno> {
        let parent = self.reduce_node(parent.clone(), true)?;
        if parent.kind != NodeKind::Directory {
            return Err(Errno::ENotDir);
        }
        if parent.child(name).is_some() {
            return Err(Errno::EExist);
        }
        let mut node = Node::new(
            name.to_string(),
            NodeKind::Symlink,
            Some(Arc::downgrade(&parent)),
            parent.filesystem.clone(),
            Arc::new(crate::tmpfs::EmptyResource),
        );
        Arc::get_mut(&mut node)
            .expect("sole owner before insertion")
            .symlink_target = Some(target.to_string());
        parent.insert_child(name.to_string(), node.clone());
        Ok(node)
    }

    /// Creates a hard link named `name` under `parent` pointing at the same
    /// resource as `existing`.
    pub fn link(&self, parent: &Arc<Node>, name: &str, existing: &Arc<Node>) -> Result<(), Errno> {
        let parent = self.reduce_node(parent.clone(), true)?;
        if parent.child(name).is_some() {
            return Err(Errno::EExist);
        }
        let linked = Node::new(
            name.to_string(),
            existing.kind,
            Some(Arc::downgrade(&parent)),
            existing.filesystem.clone(),
            existing.resource.clone(),
        );
        parent.insert_child(name.to_string(), linked);
        Ok(())
    }

    /// Removes the child named `name` from `parent`. Rejects mountpoints
    /// with `EBUSY`.
    pub fn unlink(&self, parent: &Arc<Node>, name: &str) -> Result<(), Errno> {
        let parent = self.reduce_node(parent.clone(), true)?;
        let child = parent.child(name).ok_or(Errno::ENoEnt)?;
        if child.mountpoint().is_some() {
            return Err(Errno::EBusy);
        }
        parent.remove_child(name);
        child.resource.unref();
        Ok(())
    }

    /// Reconstructs the absolute path to `node` by walking parents.
    pub fn pathname(&self, node: &Arc<Node>) -> String {
        let mut components = Vec::new();
        let mut current = node.clone();
        while !Arc::ptr_eq(&current, &self.root) {
            components.push(current.name.clone());
            current = current.parent_or_self();
            if Arc::ptr_eq(&current, &current.parent_or_self()) && components.len() > 4096 {
                break; // cycle guard; the tree is never this deep in practice
            }
        }
        components.reverse();
        if components.is_empty() {
            "/".to_string()
        } else {
            let mut out = String::new();
            for c in components {
                out.push('/');
                out.push_str(&c);
            }
            out
        }
    }
}
