use time::{Date, OffsetDateTime, UtcOffset};

/// Wall clock pinned to the controller's local UTC offset.
///
/// The offset is resolved once before the async runtime starts, since the
/// `time` crate refuses to query it from a multi-threaded process.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    offset: UtcOffset,
}

impl Clock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    #[cfg(test)]
    pub fn utc() -> Self {
        Self::new(UtcOffset::UTC)
    }

    /// Best-effort local offset, falling back to UTC.
    pub fn local() -> Self {
        Self::new(UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
    }

    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    pub fn today(&self) -> Date {
        self.now().date()
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }
}
