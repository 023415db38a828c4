//! Lock-free bitmap for block access tracking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-capacity atomic bit set.
///
/// Bits are advisory (access-recency hints), so all operations are
/// `Relaxed`; a stale read only misjudges heat.
pub(crate) struct AtomicBitmap {
    words: Box<[AtomicU64]>,
}

impl AtomicBitmap {
    /// Create a bitmap able to hold `bits` bit indices, all clear.
    pub(crate) fn new(bits: usize) -> Self {
        let words = (bits + 63) / 64;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Set the bit at `index`.
    pub(crate) fn set(&self, index: usize) {
        self.words[index / 64].fetch_or(1 << (index % 64), Ordering::Relaxed);
    }

    /// Test the bit at `index`.
    pub(crate) fn test(&self, index: usize) -> bool {
        self.words[index / 64].load(Ordering::Relaxed) & (1 << (index % 64)) != 0
    }

    /// Clear every bit. Used when a generation is rotated in.
    pub(crate) fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_and_test() {
        let bitmap = AtomicBitmap::new(2048);
        assert!(!bitmap.test(0));
        assert!(!bitmap.test(2047));

        bitmap.set(0);
        bitmap.set(63);
        bitmap.set(64);
        bitmap.set(2047);

        assert!(bitmap.test(0));
        assert!(bitmap.test(63));
        assert!(bitmap.test(64));
        assert!(bitmap.test(2047));
        assert!(!bitmap.test(1));
        assert!(!bitmap.test(65));
    }

    #[test]
    fn test_clear_all() {
        let bitmap = AtomicBitmap::new(128);
        bitmap.set(5);
        bitmap.set(100);
        bitmap.clear_all();
        assert!(!bitmap.test(5));
        assert!(!bitmap.test(100));
    }

    #[test]
    fn test_concurrent_set() {
        let bitmap = Arc::new(AtomicBitmap::new(2048));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let bitmap = Arc::clone(&bitmap);
                thread::spawn(move || {
                    for i in (t..2048).step_by(8) {
                        bitmap.set(i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for i in 0..2048 {
            assert!(bitmap.test(i));
        }
    }
}
