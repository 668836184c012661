// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        StoredTensor {
            rows: tensor.shape().0,
            cols: tensor.shape().1,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: BTreeMap<String, StoredTensor>,
}

fn to_snapshot<M: Module + ?Sized>(module: &M) -> PureResult<ModuleSnapshot> {
    let state = module.state_dict()?;
    let parameters = state
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect();
    Ok(ModuleSnapshot { parameters })
}

fn from_snapshot(snapshot: ModuleSnapshot) -> PureResult<HashMap<String, Tensor>> {
    let mut state = HashMap::new();
    for (name, tensor) in snapshot.parameters.into_iter() {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Writes the module's state dict as pretty-printed JSON.
pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let snapshot = to_snapshot(module)?;
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &snapshot).map_err(serde_error)?;
    debug!(
        path = %path.as_ref().display(),
        parameters = snapshot.parameters.len(),
        "saved json snapshot"
    );
    Ok(())
}

/// Restores a state dict written by [`save_json`]. Every parameter of the
/// module must be present with a matching shape.
pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = serde_json::from_reader(reader).map_err(serde_error)?;
    let state = from_snapshot(snapshot)?;
    module.load_state_dict(&state)
}

pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let snapshot = to_snapshot(module)?;
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, &snapshot).map_err(serde_error)?;
    debug!(
        path = %path.as_ref().display(),
        parameters = snapshot.parameters.len(),
        "saved bincode snapshot"
    );
    Ok(())
}

pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = bincode::deserialize_from(reader).map_err(serde_error)?;
    let state = from_snapshot(snapshot)?;
    module.load_state_dict(&state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::conv::{Conv2d, Padding};
    use crate::layers::conv_unit::ConvUnit;
    use std::fs;
    use tempfile::tempdir;

    fn unit(seed: u64) -> ConvUnit {
        ConvUnit::new("io_conv1", 1, 2, (3, 3), (1, 1), Padding::Same, (4, 4), Some(seed))
            .unwrap()
            .with_batch_norm(0.01, 1e-3)
            .unwrap()
    }

    #[test]
    fn save_and_load_roundtrip_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unit.json");
        let source = unit(1);
        save_json(&source, &path).unwrap();
        let mut target = unit(2);
        assert_ne!(source.state_dict().unwrap(), target.state_dict().unwrap());
        load_json(&mut target, &path).unwrap();
        assert_eq!(source.state_dict().unwrap(), target.state_dict().unwrap());
    }

    #[test]
    fn save_and_load_roundtrip_bincode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unit.bin");
        let source = unit(3);
        save_bincode(&source, &path).unwrap();
        let mut target = unit(4);
        load_bincode(&mut target, &path).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > 0);
        assert_eq!(source.state_dict().unwrap(), target.state_dict().unwrap());
    }

    #[test]
    fn loading_into_a_different_module_reports_the_missing_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conv.json");
        let conv = Conv2d::new("other", 1, 2, (3, 3), (1, 1), Padding::Same, (4, 4), Some(1))
            .unwrap();
        save_json(&conv, &path).unwrap();
        let mut target = unit(5);
        let err = load_json(&mut target, &path).unwrap_err();
        assert_eq!(
            err,
            TensorError::MissingParameter {
                name: "io_conv1::weight".into()
            }
        );
    }

    #[test]
    fn loading_mismatched_shapes_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conv.bin");
        let wide = Conv2d::new("c", 1, 4, (3, 3), (1, 1), Padding::Same, (4, 4), Some(1)).unwrap();
        save_bincode(&wide, &path).unwrap();
        let mut narrow =
            Conv2d::new("c", 1, 2, (3, 3), (1, 1), Padding::Same, (4, 4), Some(1)).unwrap();
        assert!(matches!(
            load_bincode(&mut narrow, &path),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let mut target = unit(6);
        assert!(matches!(
            load_json(&mut target, dir.path().join("absent.json")),
            Err(TensorError::IoError { .. })
        ));
    }
}
