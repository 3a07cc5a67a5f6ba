//! Bounded, growable registry mapping small integer ids to open handles.
//!
//! The backing store's length is the high-water mark. A slot below it holding
//! `None` is a tombstone and may be reused. Retiring the top slot lowers the
//! high-water mark by exactly one; trailing tombstones exposed by that are not
//! swept, so the mark can sit above the greatest live id until those slots are
//! reused. When the mark reaches zero the store is released entirely.

use crate::error::CdfError;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub(crate) usize);

impl FileId {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct OpenFileTable<T> {
    slots: Option<Vec<Option<T>>>,
    capacity: usize,
    system_ceiling: usize,
    live: usize,
}

fn reserve_error(n: usize) -> CdfError {
    CdfError::InvalidArgument(format!("unable to allocate a file table of {n} entries"))
}

impl<T> OpenFileTable<T> {
    pub fn new(default_capacity: usize, system_ceiling: usize) -> Self {
        Self {
            slots: None,
            capacity: default_capacity.min(system_ceiling),
            system_ceiling,
            live: 0,
        }
    }

    /// Negotiate the table capacity.
    ///
    /// `0` makes sure a backing store exists at the current capacity. A
    /// positive request that is below the current capacity but would not hold
    /// every slot up to the high-water mark is ignored. Otherwise the table is
    /// rebuilt at `min(requested, system_ceiling)`, keeping every id in place.
    /// On allocation failure the existing table is left untouched.
    pub fn allocate(&mut self, requested: usize) -> Result<usize, CdfError> {
        if requested == 0 {
            if self.slots.is_none() {
                let mut slots = Vec::new();
                slots
                    .try_reserve_exact(self.capacity)
                    .map_err(|_| reserve_error(self.capacity))?;
                self.slots = Some(slots);
            }
            return Ok(self.capacity);
        }

        let high_water = self.high_water();
        if requested < self.capacity && requested <= high_water {
            return Ok(self.capacity);
        }

        let alloc_size = requested.min(self.system_ceiling).max(high_water);
        let mut fresh: Vec<Option<T>> = Vec::new();
        fresh
            .try_reserve_exact(alloc_size)
            .map_err(|_| reserve_error(alloc_size))?;
        if let Some(old) = self.slots.take() {
            fresh.extend(old);
        }
        self.slots = Some(fresh);
        if alloc_size != self.capacity {
            debug!(from = self.capacity, to = alloc_size, "file table resized");
        }
        self.capacity = alloc_size;
        Ok(alloc_size)
    }

    /// First reusable id, growing to the system ceiling once if the table is full.
    pub fn find_free_slot(&mut self) -> Result<FileId, CdfError> {
        self.allocate(0)?;
        if let Some(idx) = self.slots_ref().iter().position(Option::is_none) {
            return Ok(FileId(idx));
        }
        let high_water = self.high_water();
        if high_water >= self.capacity {
            if self.capacity >= self.system_ceiling {
                return Err(CdfError::TooManyOpenFiles {
                    limit: self.system_ceiling,
                });
            }
            self.allocate(self.system_ceiling)?;
        }
        Ok(FileId(high_water))
    }

    /// Place a value into a tombstoned slot or at the high-water mark.
    pub fn install(&mut self, id: FileId, value: T) -> Result<(), CdfError> {
        self.allocate(0)?;
        let capacity = self.capacity;
        let slots = self.slots_mut();
        let idx = id.0;
        if idx < slots.len() {
            if slots[idx].is_some() {
                return Err(CdfError::InvalidArgument(format!("file id {id} is in use")));
            }
            slots[idx] = Some(value);
        } else if idx == slots.len() && idx < capacity {
            slots.push(Some(value));
        } else {
            return Err(CdfError::InvalidArgument(format!(
                "file id {id} is outside the table"
            )));
        }
        self.live += 1;
        Ok(())
    }

    /// Swap the value of a live slot, returning the previous occupant.
    pub fn replace(&mut self, id: FileId, value: T) -> Result<T, CdfError> {
        match self.get_mut(id) {
            Some(slot) => Ok(std::mem::replace(slot, value)),
            None => Err(CdfError::BadIdentifier(id.0)),
        }
    }

    pub fn retire(&mut self, id: FileId) -> Option<T> {
        let slots = self.slots.as_mut()?;
        let value = slots.get_mut(id.0)?.take()?;
        self.live -= 1;
        if id.0 + 1 == slots.len() {
            slots.pop();
        }
        if slots.is_empty() {
            self.slots = None;
            debug!("file table released");
        }
        Some(value)
    }

    pub fn get(&self, id: FileId) -> Option<&T> {
        self.slots.as_ref()?.get(id.0)?.as_ref()
    }

    pub fn get_mut(&mut self, id: FileId) -> Option<&mut T> {
        self.slots.as_mut()?.get_mut(id.0)?.as_mut()
    }

    /// Mutable access to two distinct live slots at once.
    pub fn get_pair_mut(&mut self, a: FileId, b: FileId) -> Option<(&mut T, &mut T)> {
        if a == b {
            return None;
        }
        let slots = self.slots.as_mut()?;
        if a.0 >= slots.len() || b.0 >= slots.len() {
            return None;
        }
        let (lo, hi) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        let (head, tail) = slots.split_at_mut(hi);
        let lo_ref = head[lo].as_mut()?;
        let hi_ref = tail[0].as_mut()?;
        if a.0 < b.0 {
            Some((lo_ref, hi_ref))
        } else {
            Some((hi_ref, lo_ref))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FileId, &T)> {
        self.slots
            .iter()
            .flat_map(|slots| slots.iter().enumerate())
            .filter_map(|(idx, slot)| slot.as_ref().map(|v| (FileId(idx), v)))
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn high_water(&self) -> usize {
        self.slots.as_ref().map_or(0, Vec::len)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn system_ceiling(&self) -> usize {
        self.system_ceiling
    }

    pub fn is_allocated(&self) -> bool {
        self.slots.is_some()
    }

    fn slots_ref(&self) -> &[Option<T>] {
        self.slots.as_deref().unwrap_or(&[])
    }

    fn slots_mut(&mut self) -> &mut Vec<Option<T>> {
        self.slots.get_or_insert_with(Vec::new)
    }
}
