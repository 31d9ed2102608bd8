/// Index of a buffer pool frame.
pub type FrameId = usize;

/// Eviction policy over unpinned frames. The buffer pool serializes all
/// calls behind its own latch, so implementations need no internal
/// locking.
pub trait Replacer: Send {
    /// Select a frame to evict. Returns None if no frame can be evicted.
    fn victim(&mut self) -> Option<FrameId>;

    /// Remove a frame from the eviction candidates. No-op if absent.
    fn pin(&mut self, frame_id: FrameId);

    /// Make a frame an eviction candidate. No-op if already present.
    fn unpin(&mut self, frame_id: FrameId);

    /// Number of evictable frames.
    fn size(&self) -> usize;
}
