use mobisync_core::QueryDescription;

/// Position of a pull within its result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullCursor {
    remaining: u64,
    initial_skip: u64,
    read: u64,
}

impl PullCursor {
    /// Starts at the query's skip, bounded by its top.
    pub fn new(query: &QueryDescription) -> Self {
        Self {
            remaining: query.top.unwrap_or(u64::MAX),
            initial_skip: query.skip.unwrap_or(0),
            read: 0,
        }
    }

    /// Rows still allowed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Rows read since the last reset.
    pub fn read(&self) -> u64 {
        self.read
    }

    /// Offset of the next row in the current result set.
    pub fn position(&self) -> u64 {
        self.initial_skip + self.read
    }

    /// Returns true once the requested number of rows was read.
    pub fn complete(&self) -> bool {
        self.remaining == 0
    }

    /// Counts one row. Returns false if the cursor was already complete.
    pub fn on_next(&mut self) -> bool {
        if self.complete() {
            return false;
        }
        self.remaining -= 1;
        self.read += 1;
        true
    }

    /// Restarts positioning for a new result set; `remaining` is kept.
    pub fn reset(&mut self) {
        self.initial_skip = 0;
        self.read = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_by_default() {
        let cursor = PullCursor::new(&QueryDescription::new("todo"));
        assert_eq!(cursor.remaining(), u64::MAX);
        assert_eq!(cursor.position(), 0);
        assert!(!cursor.complete());
    }

    #[test]
    fn counts_down_to_top() {
        let mut cursor = PullCursor::new(&QueryDescription::new("todo").with_skip(5).with_top(2));
        assert_eq!(cursor.position(), 5);
        assert!(cursor.on_next());
        assert!(cursor.on_next());
        assert!(!cursor.on_next());
        assert!(cursor.complete());
        assert_eq!(cursor.position(), 7);
        assert_eq!(cursor.read(), 2);
    }

    #[test]
    fn reset_keeps_remaining() {
        let mut cursor = PullCursor::new(&QueryDescription::new("todo").with_skip(3).with_top(10));
        cursor.on_next();
        cursor.reset();
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.remaining(), 9);
    }
}
