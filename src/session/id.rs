//! Session-ID allocation
//!
//! IDs are 16-bit. `0` is reserved for the control channel and `0xFFFF` is
//! the invalid marker, leaving `1..=0xFFFE` allocatable. Released IDs are
//! recycled LIFO.

use super::SessionError;

/// Marker for "no session"; never allocated.
pub const INVALID_ID: u16 = 0xFFFF;

/// Free-list allocator over the usable session-ID space.
#[derive(Debug)]
pub struct IdMgr {
    /// Next never-allocated ID.
    next: u32,
    free: Vec<u16>,
}

impl IdMgr {
    /// Number of concurrently allocatable IDs.
    pub const CAPACITY: usize = 0xFFFE;

    pub fn new() -> Self {
        Self {
            next: 1,
            free: Vec::new(),
        }
    }

    /// Allocate an ID, preferring recycled ones.
    pub fn get(&mut self) -> Result<u16, SessionError> {
        if let Some(id) = self.free.pop() {
            return Ok(id);
        }
        if self.next > Self::CAPACITY as u32 {
            return Err(SessionError::SessionExceeded);
        }
        let id = self.next as u16;
        self.next += 1;
        Ok(id)
    }

    /// Return an ID to the pool.
    pub fn put(&mut self, id: u16) {
        debug_assert!(id != 0 && id != INVALID_ID);
        self.free.push(id);
    }
}

impl Default for IdMgr {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_hands_out_reserved_ids() {
        let mut ids = IdMgr::new();
        for _ in 0..100 {
            let id = ids.get().unwrap();
            assert_ne!(id, 0);
            assert_ne!(id, INVALID_ID);
        }
    }

    #[test]
    fn test_exhaustion_and_single_slot_reuse() {
        let mut ids = IdMgr::new();
        let mut held = Vec::with_capacity(IdMgr::CAPACITY);
        for _ in 0..IdMgr::CAPACITY {
            held.push(ids.get().unwrap());
        }
        assert!(matches!(ids.get(), Err(SessionError::SessionExceeded)));

        // Releasing one frees exactly one slot.
        ids.put(held[7]);
        assert_eq!(ids.get().unwrap(), held[7]);
        assert!(matches!(ids.get(), Err(SessionError::SessionExceeded)));
    }

    #[test]
    fn test_recycles_before_fresh() {
        let mut ids = IdMgr::new();
        let a = ids.get().unwrap();
        ids.put(a);
        assert_eq!(ids.get().unwrap(), a);
    }
}
