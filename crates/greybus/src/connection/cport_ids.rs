/// Host-side CPort id space `[0, limit)`, lowest free id first.
#[derive(Debug)]
pub(crate) struct CPortIdMap {
    in_use: Vec<bool>,
}

impl CPortIdMap {
    pub fn new(limit: u16) -> Self {
        Self {
            in_use: vec![false; usize::from(limit)],
        }
    }

    pub fn limit(&self) -> u16 {
        // Constructed from a u16.
        self.in_use.len() as u16
    }

    pub fn allocate(&mut self) -> Option<u16> {
        let id = self.in_use.iter().position(|used| !used)?;
        self.in_use[id] = true;
        Some(id as u16)
    }

    /// Returns false if `id` was not allocated.
    pub fn free(&mut self, id: u16) -> bool {
        match self.in_use.get_mut(usize::from(id)) {
            Some(used) if *used => {
                *used = false;
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    fn allocated(&self) -> usize {
        self.in_use.iter().filter(|used| **used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_available_first() {
        let mut ids = CPortIdMap::new(4);
        assert_eq!(ids.allocate(), Some(0));
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));

        assert!(ids.free(1));
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(3));
        assert_eq!(ids.allocate(), None);
        assert_eq!(ids.allocated(), 4);
    }

    #[test]
    fn free_rejects_unallocated() {
        let mut ids = CPortIdMap::new(2);
        assert!(!ids.free(0));
        assert!(!ids.free(9));
        ids.allocate();
        assert!(ids.free(0));
        assert!(!ids.free(0));
    }
}
