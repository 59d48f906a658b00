//! Tile cache line states. Lines not present are `Invalid`.

use hashbrown::HashMap;

use crate::core::Address;
use crate::protocol::CacheState;

#[derive(Debug, Default, Clone)]
pub struct CacheArray {
    lines: HashMap<Address, CacheState>,
}

impl CacheArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, address: Address) -> CacheState {
        self.lines.get(&address).copied().unwrap_or_default()
    }

    pub fn set(&mut self, address: Address, state: CacheState) {
        if state == CacheState::Invalid {
            self.lines.remove(&address);
        } else {
            self.lines.insert(address, state);
        }
    }

    /// Number of valid lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, CacheState)> + '_ {
        self.lines.iter().map(|(a, s)| (*a, *s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_lines_are_not_stored() {
        let mut cache = CacheArray::new();
        assert_eq!(cache.state(0x40), CacheState::Invalid);
        cache.set(0x40, CacheState::Modified);
        assert_eq!(cache.state(0x40), CacheState::Modified);
        assert_eq!(cache.len(), 1);
        cache.set(0x40, CacheState::Invalid);
        assert!(cache.is_empty());
    }
}
