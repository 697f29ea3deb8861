//! Object descriptors and spawn records
//!
//! Every recorded state begins with an [`ObjectDescriptor`], followed by
//! the component payload written by the object's recorders. Spawn-time pose
//! lives in the persistent side-channel as a [`SpawnState`].

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::buffer::{StateRead, StateWrite};
use crate::error::BufferError;
use crate::identity::{IdentityWidth, ObjectId};

/// Sub-identities observed under one object (e.g. child components)
pub type ObservedIds = SmallVec<[ObjectId; 4]>;

/// Identifier of the template an object is instantiated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefabId(pub u32);

/// Everything needed to recreate an object during playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub prefab: PrefabId,
    pub parent: Option<ObjectId>,
    pub observed: ObservedIds,
}

impl ObjectDescriptor {
    pub fn new(prefab: PrefabId) -> Self {
        Self {
            prefab,
            parent: None,
            observed: SmallVec::new(),
        }
    }

    pub fn with_parent(mut self, parent: ObjectId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn write_to<W: StateWrite + ?Sized>(
        &self,
        w: &mut W,
        width: IdentityWidth,
    ) -> Result<(), BufferError> {
        w.write(&self.prefab.0)?;
        w.write_optional_identity(self.parent, width)?;
        write_observed(w, &self.observed, width)
    }

    pub fn read_from<R: StateRead + ?Sized>(
        r: &mut R,
        width: IdentityWidth,
    ) -> Result<Self, BufferError> {
        Ok(Self {
            prefab: PrefabId(r.read()?),
            parent: r.read_optional_identity(width)?,
            observed: read_observed(r, width)?,
        })
    }
}

/// Initial pose of an object at the moment it was spawned
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnState {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub parent: Option<ObjectId>,
    pub observed: ObservedIds,
}

impl Default for SpawnState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            parent: None,
            observed: SmallVec::new(),
        }
    }
}

impl SpawnState {
    pub fn at(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            ..Default::default()
        }
    }

    pub fn write_to<W: StateWrite + ?Sized>(
        &self,
        w: &mut W,
        width: IdentityWidth,
    ) -> Result<(), BufferError> {
        w.write(&self.position)?;
        w.write(&self.rotation)?;
        w.write(&self.scale)?;
        w.write_optional_identity(self.parent, width)?;
        write_observed(w, &self.observed, width)
    }

    pub fn read_from<R: StateRead + ?Sized>(
        r: &mut R,
        width: IdentityWidth,
    ) -> Result<Self, BufferError> {
        Ok(Self {
            position: r.read()?,
            rotation: r.read()?,
            scale: r.read()?,
            parent: r.read_optional_identity(width)?,
            observed: read_observed(r, width)?,
        })
    }
}

fn write_observed<W: StateWrite + ?Sized>(
    w: &mut W,
    observed: &[ObjectId],
    width: IdentityWidth,
) -> Result<(), BufferError> {
    // u8 count; objects observe a handful of components at most
    let count = observed.len().min(u8::MAX as usize);
    w.write(&(count as u8))?;
    for &id in &observed[..count] {
        w.write_identity(id, width)?;
    }
    Ok(())
}

fn read_observed<R: StateRead + ?Sized>(
    r: &mut R,
    width: IdentityWidth,
) -> Result<ObservedIds, BufferError> {
    let count = r.read::<u8>()? as usize;
    let mut observed = SmallVec::with_capacity(count);
    for _ in 0..count {
        observed.push(r.read_identity(width)?);
    }
    Ok(observed)
}
