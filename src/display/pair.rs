//! Double-buffered render targets

use crate::types::BufferHandle;

/// Two render targets used alternately
///
/// The consumer reads from `targets[reading_index]` while the producer draws
/// into the other one. Only [`RenderTargetPair::swap`] changes which is which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetPair {
    pub targets: [BufferHandle; 2],
    pub color_buffers: [BufferHandle; 2],
    reading_index: usize,
}

impl RenderTargetPair {
    pub fn new(targets: [BufferHandle; 2], color_buffers: [BufferHandle; 2]) -> Self {
        Self {
            targets,
            color_buffers,
            reading_index: 0,
        }
    }

    pub fn reading_index(&self) -> usize {
        self.reading_index
    }

    /// Target currently drawn into
    pub fn writing_target(&self) -> BufferHandle {
        self.targets[1 - self.reading_index]
    }

    /// Target currently read from
    pub fn reading_target(&self) -> BufferHandle {
        self.targets[self.reading_index]
    }

    /// Color buffer consumers sample from
    pub fn reading_color_buffer(&self) -> BufferHandle {
        self.color_buffers[self.reading_index]
    }

    /// Exchange reading and writing roles
    pub fn swap(&mut self) -> usize {
        self.reading_index = 1 - self.reading_index;
        self.reading_index
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.targets.contains(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_swap_restores_reading_index() {
        let mut pair = RenderTargetPair::new(
            [BufferHandle(1), BufferHandle(2)],
            [BufferHandle(11), BufferHandle(12)],
        );
        assert_eq!(pair.reading_index(), 0);
        assert_eq!(pair.writing_target(), BufferHandle(2));

        pair.swap();
        assert_eq!(pair.reading_target(), BufferHandle(2));
        assert_eq!(pair.writing_target(), BufferHandle(1));
        assert_eq!(pair.reading_color_buffer(), BufferHandle(12));

        pair.swap();
        assert_eq!(pair.reading_index(), 0);
    }
}
