/// Per-instance caps enforced while (de)serializing. Unlimited by default.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub string_max: u64,
    pub container_max: u64,
    pub stream_max: u64,
}

impl Limits {
    pub const fn none() -> Self {
        Self { string_max: u64::MAX, container_max: u64::MAX, stream_max: u64::MAX }
    }

    pub const fn with_string_max(mut self, max: u64) -> Self {
        self.string_max = max;
        self
    }

    pub const fn with_container_max(mut self, max: u64) -> Self {
        self.container_max = max;
        self
    }

    pub const fn with_stream_max(mut self, max: u64) -> Self {
        self.stream_max = max;
        self
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::none()
    }
}
