//! Single-file hierarchical binary container.
//!
//! The container mirrors the HDF5 object model at a small scale: a root [`Group`] holding
//! named members, each either a child group, a typed dataset, or an empty placeholder, plus
//! group-level attributes. Member and attribute order is the order of creation.
//!
//! File layout:
//!
//! ```text
//! magic    8 bytes   "\x89BPC\r\n\x1a\n"
//! version  u32 LE
//! length   u64 LE    body length in bytes
//! digest   32 bytes  SHA-256 of the body
//! body     bincode-encoded root group
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tree::Value;

/// Leading bytes of every container file.
pub const MAGIC: [u8; 8] = *b"\x89BPC\r\n\x1a\n";
/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 8 + 4 + 8 + 32;

/// Member of a [`Group`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Member {
    /// Child group.
    Group(Group),
    /// Typed dataset.
    Dataset(Value),
    /// Placeholder with no data.
    Empty,
}

/// A named collection of members and attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    attrs: Vec<(String, Value)>,
    members: Vec<(String, Member)>,
}

impl Group {
    fn check_free(&self, name: &str) -> Result<(), String> {
        if name.is_empty() || name.contains('/') {
            return Err(format!("invalid member name '{name}'"));
        }
        if self.members.iter().any(|(n, _)| n == name) {
            return Err(format!("member '{name}' already exists"));
        }
        Ok(())
    }

    /// Creates a child group and returns it for population.
    pub fn create_group(&mut self, name: &str) -> Result<&mut Group, String> {
        self.check_free(name)?;
        self.members
            .push((name.to_string(), Member::Group(Group::default())));
        match self.members.last_mut() {
            Some((_, Member::Group(group))) => Ok(group),
            _ => Err(format!("failed to create group '{name}'")),
        }
    }

    /// Writes a dataset.
    pub fn write_dataset(&mut self, name: &str, value: Value) -> Result<(), String> {
        self.check_free(name)?;
        self.members.push((name.to_string(), Member::Dataset(value)));
        Ok(())
    }

    /// Writes an empty placeholder.
    pub fn write_empty(&mut self, name: &str) -> Result<(), String> {
        self.check_free(name)?;
        self.members.push((name.to_string(), Member::Empty));
        Ok(())
    }

    /// Sets a scalar attribute, replacing any previous value.
    pub fn set_attr(&mut self, name: &str, value: Value) -> Result<(), String> {
        if !value.is_scalar() {
            return Err(format!(
                "attribute '{name}' must be a scalar, found {}",
                value.kind()
            ));
        }
        match self.attrs.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.attrs.push((name.to_string(), value)),
        }
        Ok(())
    }

    /// Attributes in creation order.
    pub fn attrs(&self) -> &[(String, Value)] {
        &self.attrs
    }

    /// Members in creation order.
    pub fn members(&self) -> &[(String, Member)] {
        &self.members
    }

    /// Consumes the group, yielding attributes and members.
    pub fn into_parts(self) -> (Vec<(String, Value)>, Vec<(String, Member)>) {
        (self.attrs, self.members)
    }
}

/// A container file being built or read.
#[derive(Debug)]
pub struct ContainerFile {
    path: PathBuf,
    root: Group,
}

impl ContainerFile {
    /// Starts a new, empty container destined for `path`. Nothing is written until
    /// [`ContainerFile::flush`].
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            root: Group::default(),
        }
    }

    /// Reads and verifies the container at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();
        let bytes = fs::read(&path).map_err(|e| e.to_string())?;
        let root = decode(&bytes)?;
        Ok(Self { path, root })
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root group.
    pub fn root(&self) -> &Group {
        &self.root
    }

    /// Mutable root group.
    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    /// Consumes the file, yielding the root group.
    pub fn into_root(self) -> Group {
        self.root
    }

    /// Encodes the container and writes it next to the destination before renaming it
    /// into place, so a failed write never leaves a truncated file behind.
    pub fn flush(&self) -> Result<u64, String> {
        let bytes = encode(&self.root)?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".partial");
        let staging = PathBuf::from(staging);

        let result = fs::File::create(&staging)
            .and_then(|mut file| {
                file.write_all(&bytes)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&staging, &self.path));
        if let Err(err) = result {
            let _ = fs::remove_file(&staging);
            return Err(err.to_string());
        }
        Ok(bytes.len() as u64)
    }
}

fn encode(root: &Group) -> Result<Vec<u8>, String> {
    let body = bincode::serialize(root).map_err(|e| e.to_string())?;
    let digest = Sha256::digest(&body);

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&digest);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<Group, String> {
    if bytes.len() < HEADER_LEN {
        return Err(format!(
            "file too short for a container header ({} bytes)",
            bytes.len()
        ));
    }
    let (header, body) = bytes.split_at(HEADER_LEN);
    if header[..8] != MAGIC {
        return Err("not a screen-profile container (bad magic)".into());
    }

    let mut word = [0u8; 4];
    word.copy_from_slice(&header[8..12]);
    let version = u32::from_le_bytes(word);
    if version != FORMAT_VERSION {
        return Err(format!(
            "unsupported container version {version} (expected {FORMAT_VERSION})"
        ));
    }

    let mut long = [0u8; 8];
    long.copy_from_slice(&header[12..20]);
    let length = u64::from_le_bytes(long);
    if length != body.len() as u64 {
        return Err(format!(
            "truncated container: header declares {length} bytes, found {}",
            body.len()
        ));
    }

    if Sha256::digest(body).as_slice() != &header[20..HEADER_LEN] {
        return Err("container checksum mismatch".into());
    }

    bincode::deserialize(body).map_err(|e| format!("corrupt container body: {e}"))
}
