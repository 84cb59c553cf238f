//! Arena of model parameters addressed by handle.
//!
//! Every parameter tensor of a model is stored once in a [`WeightArena`].
//! Operators keep [`WeightHandle`]s and resolve them on each forward call,
//! so rewiring a model (fusion, in-place expert replacement) moves handles
//! around without touching tensor storage. Replacing a slot is visible to
//! every operator that holds its handle.

use candle_core::{Shape, Tensor};
use candle_nn::VarBuilder;

use crate::error::{FuseError, Result};

/// Index of a parameter inside a [`WeightArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeightHandle(usize);

impl WeightHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

struct Slot {
    name: String,
    tensor: Option<Tensor>,
}

/// Owner of all parameter storage of one model.
#[derive(Default)]
pub struct WeightArena {
    slots: Vec<Slot>,
}

impl WeightArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a tensor and return its handle.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> WeightHandle {
        self.slots.push(Slot {
            name: name.into(),
            tensor: Some(tensor),
        });
        WeightHandle(self.slots.len() - 1)
    }

    /// Load `name` from a `VarBuilder` and store it under its full dotted path.
    pub fn load<S: Into<Shape>>(
        &mut self,
        vb: &VarBuilder,
        shape: S,
        name: &str,
    ) -> Result<WeightHandle> {
        let tensor = vb.get(shape, name)?;
        let full_name = vb.pp(name).prefix();
        Ok(self.insert(full_name, tensor))
    }

    /// Resolve a handle to its tensor.
    pub fn get(&self, handle: WeightHandle) -> Result<&Tensor> {
        let slot = self.slot(handle)?;
        slot.tensor.as_ref().ok_or_else(|| FuseError::ReleasedWeight {
            index: handle.0,
            name: slot.name.clone(),
        })
    }

    pub fn name(&self, handle: WeightHandle) -> Result<&str> {
        Ok(&self.slot(handle)?.name)
    }

    pub fn dims(&self, handle: WeightHandle) -> Result<&[usize]> {
        Ok(self.get(handle)?.dims())
    }

    /// Swap the tensor behind `handle` for one of identical shape, returning
    /// the previous tensor.
    pub fn replace(&mut self, handle: WeightHandle, tensor: Tensor) -> Result<Tensor> {
        let current = self.get(handle)?;
        if current.dims() != tensor.dims() {
            return Err(FuseError::ShapeMismatch {
                name: self.slots[handle.0].name.clone(),
                expected: current.dims().to_vec(),
                got: tensor.dims().to_vec(),
            });
        }
        let slot = &mut self.slots[handle.0];
        slot.tensor
            .replace(tensor)
            .ok_or_else(|| FuseError::ReleasedWeight {
                index: handle.0,
                name: slot.name.clone(),
            })
    }

    /// Drop the storage behind `handle`. Later lookups fail with
    /// [`FuseError::ReleasedWeight`].
    pub fn release(&mut self, handle: WeightHandle) -> Result<Tensor> {
        let index = handle.0;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(FuseError::UnknownWeight { index })?;
        slot.tensor.take().ok_or_else(|| FuseError::ReleasedWeight {
            index,
            name: slot.name.clone(),
        })
    }

    /// Number of slots ever allocated, released ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots still holding a tensor.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.tensor.is_some()).count()
    }

    /// Total bytes held by live slots.
    pub fn live_bytes(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.tensor.as_ref())
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }

    fn slot(&self, handle: WeightHandle) -> Result<&Slot> {
        self.slots
            .get(handle.0)
            .ok_or(FuseError::UnknownWeight { index: handle.0 })
    }
}

impl std::fmt::Debug for WeightArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightArena")
            .field("slots", &self.slots.len())
            .field("live", &self.live_count())
            .finish()
    }
}
