/// A cached value stamped with the generation it was computed in.
#[derive(Debug, Clone)]
pub(crate) struct Versioned<T> {
    value: T,
    generation: u64,
}

impl<T> Versioned<T> {
    pub(crate) fn new(value: T, generation: u64) -> Self {
        Self { value, generation }
    }

    /// The value, if it belongs to `generation`.
    pub(crate) fn current(&self, generation: u64) -> Option<&T> {
        (self.generation == generation).then_some(&self.value)
    }
}
