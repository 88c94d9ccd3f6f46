//! Lock hierarchy checks.
//!
//! Every lock in the capture path has a [`LockLevel`]. A thread may only
//! acquire a lock whose level is strictly higher than every level it already
//! holds, so a per-camera lock must be taken before the ring buffer lock and
//! never the other way round. Debug builds panic on a violation; release
//! builds skip the bookkeeping.

use std::cell::RefCell;
use std::marker::PhantomData;

/// Position of a lock in the acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Per-camera state owned by the capture layer.
    Camera = 10,
    /// Ring buffer storage.
    RingBuffer = 20,
    /// Serializes packet delivery to listeners.
    Delivery = 30,
    /// Listener registry.
    Listeners = 40,
}

thread_local! {
    static HELD: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

/// Marks a level as held by the current thread until dropped.
///
/// Not `Send`: the token must be released on the thread that acquired it.
#[derive(Debug)]
#[must_use = "the level is released when the token is dropped"]
pub struct LevelToken {
    level: LockLevel,
    _not_send: PhantomData<*const ()>,
}

impl LevelToken {
    pub fn level(&self) -> LockLevel {
        self.level
    }
}

impl Drop for LevelToken {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held.iter().rposition(|l| *l == self.level) {
                    held.remove(pos);
                }
            });
        }
    }
}

/// Record that the current thread is about to acquire a lock at `level`.
///
/// Call this before locking so a violation is reported instead of
/// deadlocking.
pub fn acquire(level: LockLevel) -> LevelToken {
    if cfg!(debug_assertions) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(highest) = held.iter().max() {
                assert!(
                    level > *highest,
                    "lock order violation: acquiring {level:?} while holding {highest:?}"
                );
            }
            held.push(level);
        });
    }
    LevelToken {
        level,
        _not_send: PhantomData,
    }
}

/// Levels currently held by this thread, in acquisition order.
pub fn held_levels() -> Vec<LockLevel> {
    HELD.with(|held| held.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascending_acquisition() {
        let camera = acquire(LockLevel::Camera);
        let ring = acquire(LockLevel::RingBuffer);
        assert_eq!(held_levels(), vec![LockLevel::Camera, LockLevel::RingBuffer]);
        drop(ring);
        drop(camera);
        assert!(held_levels().is_empty());
    }

    #[test]
    fn test_reacquire_after_release() {
        let ring = acquire(LockLevel::RingBuffer);
        drop(ring);
        let _camera = acquire(LockLevel::Camera);
        assert_eq!(held_levels(), vec![LockLevel::Camera]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_camera_after_ring_panics() {
        let _ring = acquire(LockLevel::RingBuffer);
        let _camera = acquire(LockLevel::Camera);
    }
}
