//! Persistence of result trees to hierarchical containers.
//!
//! [`HierarchicalStore`] is the seam between a measurement and whatever file technology
//! backs it. The mapping itself is a pair of pure recursive functions over the in-memory
//! [`Group`] model:
//!
//! - every nested tree becomes a named child group, in insertion order;
//! - every leaf value becomes a named dataset;
//! - a null becomes an empty placeholder member;
//! - the reserved `attrs` key becomes attributes on the *enclosing* group.
//!
//! Loading inverts this, placing a level's attributes (if any) first as its `attrs` entry.
//! An empty `attrs` mapping has no attributes to write and so does not survive a round
//! trip.
//!
//! Two backends encode the model on disk:
//!
//! - [`ContainerStore`] (default): the self-contained `.bpc` format in [`container`]
//! - [`Hdf5Store`]: HDF5 files, with the `storage_hdf5` feature
//!
//! A destination naming an existing directory gets a fresh, timestamped file inside it.
//! Generated names are reserved on disk before writing, so repeated saves to one directory
//! never overwrite each other.

pub mod container;
pub mod hdf5;

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppResult, ProfileError};
use crate::tree::{Node, ResultTree, ATTRS_KEY};

use container::{ContainerFile, Group, Member};

pub use self::hdf5::{Hdf5Store, HDF5_EXTENSION};

/// File extension used for generated container names.
pub const CONTAINER_EXTENSION: &str = "bpc";

/// Prefix of generated file names.
const FILE_PREFIX: &str = "screen_profile";

/// Persists and restores result trees.
pub trait HierarchicalStore: Send + Sync {
    /// Backend name, for logging.
    fn name(&self) -> &str;

    /// Writes `tree` to `destination`, returning the path actually written.
    fn save(&self, tree: &ResultTree, destination: &Path) -> AppResult<PathBuf>;

    /// Reads the tree stored at `destination`.
    fn load(&self, destination: &Path) -> AppResult<ResultTree>;
}

/// Built-in storage backends, selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// [`ContainerStore`].
    #[default]
    Container,
    /// [`Hdf5Store`].
    Hdf5,
}

impl StorageBackend {
    /// Whether this build can use the backend.
    pub fn is_available(&self) -> bool {
        match self {
            StorageBackend::Container => true,
            StorageBackend::Hdf5 => cfg!(feature = "storage_hdf5"),
        }
    }

    /// Fails with [`ProfileError::FeatureNotEnabled`] if the backend is not compiled in.
    pub fn ensure_available(&self) -> AppResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(ProfileError::FeatureNotEnabled("storage_hdf5".to_string()))
        }
    }

    /// A fresh store for this backend.
    pub fn store(&self) -> Box<dyn HierarchicalStore> {
        match self {
            StorageBackend::Container => Box::new(ContainerStore::new()),
            StorageBackend::Hdf5 => Box::new(Hdf5Store::new()),
        }
    }
}

/// Default backend: the single-file binary container in [`container`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStore;

impl ContainerStore {
    /// Creates the store.
    pub fn new() -> Self {
        Self
    }
}

impl HierarchicalStore for ContainerStore {
    fn name(&self) -> &str {
        "container"
    }

    fn save(&self, tree: &ResultTree, destination: &Path) -> AppResult<PathBuf> {
        let path = save_with(destination, CONTAINER_EXTENSION, |path| {
            let mut file = ContainerFile::create(path);
            write_group(tree, file.root_mut(), "", path)?;
            let bytes = file
                .flush()
                .map_err(|reason| ProfileError::storage_write(path, "/", reason))?;
            debug!(path = %path.display(), bytes, "Container flushed");
            Ok(())
        })?;
        info!(path = %path.display(), backend = self.name(), "Result tree saved");
        Ok(path)
    }

    fn load(&self, destination: &Path) -> AppResult<ResultTree> {
        if !destination.is_file() {
            return Err(ProfileError::storage_read(destination, "no such file"));
        }
        let file = ContainerFile::open(destination)
            .map_err(|reason| ProfileError::storage_read(destination, reason))?;
        debug!(path = %destination.display(), "Result tree loaded");
        Ok(read_group(file.into_root()))
    }
}

/// Resolves `destination`, runs `write` against the final path, and returns that path.
///
/// Missing parent directories are created. A directory destination gets a reserved,
/// uniquely named file which is removed again if `write` fails.
pub(crate) fn save_with<F>(destination: &Path, extension: &str, write: F) -> AppResult<PathBuf>
where
    F: FnOnce(&Path) -> AppResult<()>,
{
    let (path, reserved) = if destination.is_dir() {
        (reserve_file(destination, extension)?, true)
    } else {
        create_parent_dirs(destination)?;
        (destination.to_path_buf(), false)
    };

    if let Err(err) = write(&path) {
        if reserved {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove reserved file");
            }
        }
        return Err(err);
    }
    Ok(path)
}

fn create_parent_dirs(path: &Path) -> AppResult<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    if parent.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(parent).map_err(|e| {
        ProfileError::storage_write(
            path,
            "/",
            format!("failed to create directory {}: {e}", parent.display()),
        )
    })
}

/// Creates an empty, uniquely named file in `dir` and returns its path.
///
/// The name is timestamped to the millisecond; a clash gets a numeric suffix.
pub fn reserve_file(dir: &Path, extension: &str) -> AppResult<PathBuf> {
    let stem = format!(
        "{FILE_PREFIX}_{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S_%3f")
    );

    let mut candidate = dir.join(format!("{stem}.{extension}"));
    let mut suffix = 1u32;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                candidate = dir.join(format!("{stem}_{suffix}.{extension}"));
                suffix += 1;
            }
            Err(e) => {
                return Err(ProfileError::storage_write(
                    &candidate,
                    "/",
                    format!("failed to create file: {e}"),
                ))
            }
        }
    }
}

/// Mirrors `tree` into `group`. `prefix` is the key path of `tree`, used in errors.
pub fn write_group(tree: &ResultTree, group: &mut Group, prefix: &str, path: &Path) -> AppResult<()> {
    for (key, node) in tree.iter() {
        let key_path = format!("{prefix}/{key}");
        let fail = |reason: String| ProfileError::storage_write(path, &key_path, reason);

        if key == ATTRS_KEY {
            let attrs = node
                .as_group()
                .ok_or_else(|| fail("attrs must be a mapping of scalar metadata".into()))?;
            for (name, attr) in attrs.iter() {
                let value = attr.as_value().ok_or_else(|| {
                    fail(format!("attrs entry '{name}' must be a scalar value"))
                })?;
                group
                    .set_attr(name, value.clone())
                    .map_err(|reason| fail(reason))?;
            }
            continue;
        }

        match node {
            Node::Value(value) => group.write_dataset(key, value.clone()).map_err(fail)?,
            Node::Null => group.write_empty(key).map_err(fail)?,
            Node::Group(child) => {
                let child_group = group.create_group(key).map_err(fail)?;
                write_group(child, child_group, &key_path, path)?;
            }
        }
    }
    Ok(())
}

/// Inverse of [`write_group`].
pub fn read_group(group: Group) -> ResultTree {
    let (attrs, members) = group.into_parts();
    let mut tree = ResultTree::new();

    if !attrs.is_empty() {
        let attrs: ResultTree = attrs
            .into_iter()
            .map(|(name, value)| (name, Node::Value(value)))
            .collect();
        tree.insert(ATTRS_KEY, attrs);
    }

    for (name, member) in members {
        let node = match member {
            Member::Group(child) => Node::Group(read_group(child)),
            Member::Dataset(value) => Node::Value(value),
            Member::Empty => Node::Null,
        };
        tree.insert(name, node);
    }
    tree
}
