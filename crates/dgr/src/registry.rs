use std::collections::HashMap;

use crate::error::{DgrError, Result};
use crate::wire::{self, MAX_NAME_LEN, MAX_PAYLOAD, ProtocolError, Tuple};

/// Most names a slave keeps for variables it has not declared itself.
/// New undeclared names beyond this are dropped from incoming frames.
pub const MAX_UNDECLARED: usize = 1024;

/// One named variable slot.
#[derive(Debug)]
struct Entry {
    name: String,
    size: usize,
    /// Most recent value; `None` until the master reports it (slave) or the
    /// first store (master).
    value: Option<Vec<u8>>,
    /// Declared by local code. Undeclared entries come from the master ahead
    /// of the local declaration and may still change size.
    declared: bool,
}

/// Table of named, fixed-size variables.
///
/// Entries keep registration order; the master emits tuples in that order.
/// The registry holds a copy of each value: callers hand in their buffer on
/// every sync and get it back filled (slave) or have it recorded (master).
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    undeclared: usize,
    overflow_reported: bool,
}

impl Registry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known variables, declared or received.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current bytes of `name`, if a value has been stored or applied.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        let &i = self.index.get(name)?;
        self.entries[i].value.as_deref()
    }

    /// Registers `name` with `size` bytes, or confirms an existing registration.
    ///
    /// A size change for a declared name means the cooperating processes were
    /// built from different code and is refused.
    pub fn declare(&mut self, name: &str, size: usize) -> Result<usize> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(DgrError::InvalidName { name: name.to_string() });
        }
        if wire::tuple_len(name, &[]) + size > MAX_PAYLOAD {
            return Err(DgrError::PacketTooLarge { size: wire::tuple_len(name, &[]) + size });
        }

        if let Some(&i) = self.index.get(name) {
            let entry = &mut self.entries[i];
            if entry.size != size {
                return Err(DgrError::SizeMismatch {
                    name: name.to_string(),
                    registered: entry.size,
                    requested: size,
                });
            }
            if !entry.declared {
                entry.declared = true;
                self.undeclared -= 1;
            }
            return Ok(i);
        }

        Ok(self.insert(name, size, None, true))
    }

    /// Master side: records the current contents of `bytes` under `name`.
    pub fn store(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let i = self.declare(name, bytes.len())?;
        let entry = &mut self.entries[i];
        match entry.value.as_mut() {
            Some(v) => v.copy_from_slice(bytes),
            None => entry.value = Some(bytes.to_vec()),
        }
        Ok(())
    }

    /// Slave side: writes the last applied value of `name` into `bytes`.
    ///
    /// Leaves `bytes` untouched while nothing has been received for `name`, so
    /// callers keep their defaults until the master shows up.
    pub fn load(&mut self, name: &str, bytes: &mut [u8]) -> Result<()> {
        let i = self.declare(name, bytes.len())?;
        if let Some(v) = &self.entries[i].value {
            bytes.copy_from_slice(v);
        }
        Ok(())
    }

    /// Declared variables with a value, in registration order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().filter(|e| e.declared).filter_map(|e| {
            e.value.as_deref().map(|v| (e.name.as_str(), v))
        })
    }

    /// Checks every tuple against the local registrations without writing.
    pub fn check(&self, tuples: &[Tuple<'_>]) -> Result<(), ProtocolError> {
        for t in tuples {
            if let Some(&i) = self.index.get(t.name) {
                let entry = &self.entries[i];
                if entry.declared && entry.size != t.value.len() {
                    return Err(ProtocolError::SizeMismatch {
                        name: t.name.to_string(),
                        expected: entry.size,
                        actual: t.value.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Applies a whole frame: either every tuple is written or none is.
    ///
    /// Names nobody declared are kept for a later declaration, up to
    /// [`MAX_UNDECLARED`] of them.
    pub fn apply(&mut self, tuples: &[Tuple<'_>]) -> Result<(), ProtocolError> {
        self.check(tuples)?;

        for t in tuples {
            match self.index.get(t.name) {
                Some(&i) => {
                    let entry = &mut self.entries[i];
                    match entry.value.as_mut() {
                        Some(v) if v.len() == t.value.len() => v.copy_from_slice(t.value),
                        _ => entry.value = Some(t.value.to_vec()),
                    }
                    // Only undeclared entries can reach here with a new size.
                    entry.size = t.value.len();
                }
                None if self.undeclared >= MAX_UNDECLARED => {
                    if !self.overflow_reported {
                        self.overflow_reported = true;
                        log::warn!(
                            "dropping undeclared variable {:?}: already holding {MAX_UNDECLARED}",
                            t.name
                        );
                    }
                }
                None => {
                    self.insert(t.name, t.value.len(), Some(t.value.to_vec()), false);
                    self.undeclared += 1;
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, size: usize, value: Option<Vec<u8>>, declared: bool) -> usize {
        let i = self.entries.len();
        self.entries.push(Entry {
            name: name.to_string(),
            size,
            value,
            declared,
        });
        self.index.insert(name.to_string(), i);
        i
    }
}
