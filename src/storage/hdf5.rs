//! HDF5 backend.
//!
//! Requires the `storage_hdf5` feature and a native HDF5 installation. Without the feature
//! [`Hdf5Store`] still exists, but every operation fails with
//! [`ProfileError::FeatureNotEnabled`].
//!
//! Layout: groups map to HDF5 groups, leaf values to datasets (scalars as scalar datasets,
//! text as variable-length UTF-8), `attrs` to group attributes. A null is a scalar `u8`
//! dataset tagged with the `screen_profile_null` attribute. HDF5 lists links and attributes
//! by name, so every group also carries a `screen_profile_layout` attribute (JSON) recording
//! creation order.

/// File extension used for generated HDF5 names.
pub const HDF5_EXTENSION: &str = "h5";

/// Persists result trees as HDF5 files.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hdf5Store;

impl Hdf5Store {
    /// Creates the store.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(feature = "storage_hdf5"))]
mod disabled {
    use std::path::{Path, PathBuf};

    use super::Hdf5Store;
    use crate::error::{AppResult, ProfileError};
    use crate::storage::HierarchicalStore;
    use crate::tree::ResultTree;

    impl HierarchicalStore for Hdf5Store {
        fn name(&self) -> &str {
            "hdf5"
        }

        fn save(&self, _tree: &ResultTree, _destination: &Path) -> AppResult<PathBuf> {
            Err(ProfileError::FeatureNotEnabled("storage_hdf5".to_string()))
        }

        fn load(&self, _destination: &Path) -> AppResult<ResultTree> {
            Err(ProfileError::FeatureNotEnabled("storage_hdf5".to_string()))
        }
    }

}

#[cfg(feature = "storage_hdf5")]
mod enabled {
    use std::fmt::Display;
    use std::fs;
    use std::path::{Path, PathBuf};

    use ::hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenUnicode};
    use ::hdf5::{Container, File, Group as H5Group, H5Type};
    use ndarray::{ArrayD, IxDyn};
    use serde::{Deserialize, Serialize};
    use tracing::{debug, info};

    use super::{Hdf5Store, HDF5_EXTENSION};
    use crate::error::{AppResult, ProfileError};
    use crate::storage::container::{Group, Member};
    use crate::storage::{read_group, save_with, write_group, HierarchicalStore};
    use crate::tree::{ArrayValue, ResultTree, Value};

    const LAYOUT_ATTR: &str = "screen_profile_layout";
    const NULL_ATTR: &str = "screen_profile_null";

    /// Creation order of one group's attributes and members.
    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Layout {
        attrs: Vec<String>,
        members: Vec<String>,
    }

    fn msg(e: impl Display) -> String {
        e.to_string()
    }

    impl HierarchicalStore for Hdf5Store {
        fn name(&self) -> &str {
            "hdf5"
        }

        fn save(&self, tree: &ResultTree, destination: &Path) -> AppResult<PathBuf> {
            let path = save_with(destination, HDF5_EXTENSION, |path| {
                let mut root = Group::default();
                write_group(tree, &mut root, "", path)?;

                let mut staging = path.as_os_str().to_owned();
                staging.push(".partial");
                let staging = PathBuf::from(staging);

                let written = write_file(&root, &staging)
                    .and_then(|()| fs::rename(&staging, path).map_err(|e| ("/".to_string(), msg(e))));
                if let Err((key, reason)) = written {
                    let _ = fs::remove_file(&staging);
                    return Err(ProfileError::storage_write(path, key, reason));
                }
                Ok(())
            })?;
            info!(path = %path.display(), backend = self.name(), "Result tree saved");
            Ok(path)
        }

        fn load(&self, destination: &Path) -> AppResult<ResultTree> {
            if !destination.is_file() {
                return Err(ProfileError::storage_read(destination, "no such file"));
            }
            let file = File::open(destination)
                .map_err(|e| ProfileError::storage_read(destination, e))?;
            let mut root = Group::default();
            read_h5_group(&file, &mut root)
                .map_err(|reason| ProfileError::storage_read(destination, reason))?;
            debug!(path = %destination.display(), "Result tree loaded");
            Ok(read_group(root))
        }
    }

    /// Writes `root` into a new HDF5 file; the file is closed on return.
    fn write_file(root: &Group, path: &Path) -> Result<(), (String, String)> {
        let file = File::create(path).map_err(|e| ("/".to_string(), msg(e)))?;
        write_h5_group(root, &file, "")
    }

    /// Mirrors `src` into `dst`. Errors carry the key path being written.
    fn write_h5_group(src: &Group, dst: &H5Group, prefix: &str) -> Result<(), (String, String)> {
        let here = if prefix.is_empty() { "/" } else { prefix };
        let layout = Layout {
            attrs: src.attrs().iter().map(|(name, _)| name.clone()).collect(),
            members: src.members().iter().map(|(name, _)| name.clone()).collect(),
        };

        for (name, value) in src.attrs() {
            let key = format!("{prefix}/attrs/{name}");
            if name == LAYOUT_ATTR {
                return Err((key, format!("'{LAYOUT_ATTR}' is a reserved attribute name")));
            }
            write_attr(dst, name, value).map_err(|reason| (key, reason))?;
        }

        for (name, member) in src.members() {
            let key = format!("{prefix}/{name}");
            match member {
                Member::Group(child) => {
                    let group = dst.create_group(name).map_err(|e| (key.clone(), msg(e)))?;
                    write_h5_group(child, &group, &key)?;
                }
                Member::Dataset(value) => {
                    write_dataset(dst, name, value).map_err(|reason| (key, reason))?
                }
                Member::Empty => write_null(dst, name).map_err(|reason| (key, reason))?,
            }
        }

        let json = serde_json::to_string(&layout).map_err(|e| (here.to_string(), msg(e)))?;
        write_text_attr(dst, LAYOUT_ATTR, &json).map_err(|reason| (here.to_string(), reason))
    }

    fn write_text_attr(dst: &H5Group, name: &str, text: &str) -> Result<(), String> {
        let text: VarLenUnicode = text.parse().map_err(msg)?;
        dst.new_attr::<VarLenUnicode>()
            .create(name)
            .and_then(|attr| attr.write_scalar(&text))
            .map_err(msg)
    }

    fn write_attr(dst: &H5Group, name: &str, value: &Value) -> Result<(), String> {
        fn scalar<T: H5Type>(dst: &H5Group, name: &str, v: &T) -> Result<(), String> {
            dst.new_attr::<T>()
                .create(name)
                .and_then(|attr| attr.write_scalar(v))
                .map_err(msg)
        }
        match value {
            Value::Bool(v) => scalar(dst, name, v),
            Value::Int(v) => scalar(dst, name, v),
            Value::UInt(v) => scalar(dst, name, v),
            Value::Float(v) => scalar(dst, name, v),
            Value::Text(v) => write_text_attr(dst, name, v),
            Value::Array(_) => Err(format!("attribute must be a scalar, found {}", value.kind())),
        }
    }

    fn write_dataset(dst: &H5Group, name: &str, value: &Value) -> Result<(), String> {
        fn scalar<T: H5Type>(dst: &H5Group, name: &str, v: &T) -> Result<(), String> {
            dst.new_dataset::<T>()
                .create(name)
                .and_then(|ds| ds.write_scalar(v))
                .map_err(msg)
        }
        fn array<T: H5Type + Clone>(dst: &H5Group, name: &str, a: &ArrayD<T>) -> Result<(), String> {
            if a.ndim() == 0 {
                return Err("zero-dimensional arrays are not supported".into());
            }
            let data: Vec<T> = a.iter().cloned().collect();
            dst.new_dataset::<T>()
                .shape(a.shape().to_vec())
                .create(name)
                .and_then(|ds| ds.write_raw(data.as_slice()))
                .map_err(msg)
        }
        match value {
            Value::Bool(v) => scalar(dst, name, v),
            Value::Int(v) => scalar(dst, name, v),
            Value::UInt(v) => scalar(dst, name, v),
            Value::Float(v) => scalar(dst, name, v),
            Value::Text(v) => {
                let text: VarLenUnicode = v.parse().map_err(msg)?;
                scalar(dst, name, &text)
            }
            Value::Array(ArrayValue::U8(a)) => array(dst, name, a),
            Value::Array(ArrayValue::U16(a)) => array(dst, name, a),
            Value::Array(ArrayValue::U32(a)) => array(dst, name, a),
            Value::Array(ArrayValue::I32(a)) => array(dst, name, a),
            Value::Array(ArrayValue::I64(a)) => array(dst, name, a),
            Value::Array(ArrayValue::F32(a)) => array(dst, name, a),
            Value::Array(ArrayValue::F64(a)) => array(dst, name, a),
        }
    }

    fn write_null(dst: &H5Group, name: &str) -> Result<(), String> {
        let ds = dst
            .new_dataset::<u8>()
            .create(name)
            .and_then(|ds| ds.write_scalar(&0u8).map(|()| ds))
            .map_err(msg)?;
        ds.new_attr::<bool>()
            .create(NULL_ATTR)
            .and_then(|attr| attr.write_scalar(&true))
            .map_err(msg)
    }

    /// Inverse of [`write_h5_group`].
    fn read_h5_group(src: &H5Group, dst: &mut Group) -> Result<(), String> {
        let layout = match src.attr(LAYOUT_ATTR) {
            Ok(attr) => {
                let json = attr.read_scalar::<VarLenUnicode>().map_err(msg)?;
                serde_json::from_str(json.as_str()).map_err(msg)?
            }
            // Written by another tool: fall back to HDF5's name order.
            Err(_) => Layout {
                attrs: src.attr_names().map_err(msg)?,
                members: src.member_names().map_err(msg)?,
            },
        };

        for name in layout.attrs.iter().filter(|n| n.as_str() != LAYOUT_ATTR) {
            let attr = src.attr(name).map_err(msg)?;
            let value = read_value(&attr).map_err(|e| format!("attribute '{name}': {e}"))?;
            dst.set_attr(name, value)?;
        }

        for name in &layout.members {
            if let Ok(child) = src.group(name) {
                let group = dst.create_group(name)?;
                read_h5_group(&child, group)?;
                continue;
            }
            let ds = src.dataset(name).map_err(|e| format!("member '{name}': {e}"))?;
            if ds.attr_names().map_err(msg)?.iter().any(|n| n == NULL_ATTR) {
                dst.write_empty(name)?;
            } else {
                let value = read_value(&ds).map_err(|e| format!("dataset '{name}': {e}"))?;
                dst.write_dataset(name, value)?;
            }
        }
        Ok(())
    }

    fn read_value(c: &Container) -> Result<Value, String> {
        let descriptor = c.dtype().and_then(|t| t.to_descriptor()).map_err(msg)?;

        if c.is_scalar() {
            return match descriptor {
                TypeDescriptor::Boolean => c.read_scalar::<bool>().map(Value::Bool),
                TypeDescriptor::Integer(_) => c.read_scalar::<i64>().map(Value::Int),
                TypeDescriptor::Unsigned(_) => c.read_scalar::<u64>().map(Value::UInt),
                TypeDescriptor::Float(_) => c.read_scalar::<f64>().map(Value::Float),
                TypeDescriptor::VarLenUnicode => c
                    .read_scalar::<VarLenUnicode>()
                    .map(|s| Value::Text(s.as_str().to_string())),
                other => return Err(format!("unsupported scalar type {other:?}")),
            }
            .map_err(msg);
        }

        fn array<T: H5Type>(c: &Container) -> Result<ArrayD<T>, String> {
            let data = c.read_raw::<T>().map_err(msg)?;
            ArrayD::from_shape_vec(IxDyn(&c.shape()), data).map_err(msg)
        }
        let array = match descriptor {
            TypeDescriptor::Unsigned(IntSize::U1) => ArrayValue::U8(array(c)?),
            TypeDescriptor::Unsigned(IntSize::U2) => ArrayValue::U16(array(c)?),
            TypeDescriptor::Unsigned(IntSize::U4) => ArrayValue::U32(array(c)?),
            TypeDescriptor::Integer(IntSize::U4) => ArrayValue::I32(array(c)?),
            TypeDescriptor::Integer(IntSize::U8) => ArrayValue::I64(array(c)?),
            TypeDescriptor::Float(FloatSize::U4) => ArrayValue::F32(array(c)?),
            TypeDescriptor::Float(FloatSize::U8) => ArrayValue::F64(array(c)?),
            other => return Err(format!("unsupported array type {other:?}")),
        };
        Ok(Value::Array(array))
    }

}
