use relay_protocol::{ClientError, ClientResult};

/// Outstanding-work counter for one collection walk.
///
/// Starts at one (the walk itself), so an empty walk cannot complete before
/// it is done. The count must reach zero exactly once: adding after that, or
/// settling more than was added, is reported instead of silently flushing
/// early or hanging.
#[derive(Debug)]
pub struct PendingJoin {
    outstanding: usize,
    completed: bool,
}

impl Default for PendingJoin {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingJoin {
    pub fn new() -> Self {
        Self {
            outstanding: 1,
            completed: false,
        }
    }

    pub fn add(&mut self) -> ClientResult<()> {
        if self.completed {
            return Err(ClientError::JoinMismatch(
                "work added after the join completed".to_owned(),
            ));
        }
        self.outstanding += 1;
        Ok(())
    }

    /// Settle one unit. Returns true on the transition to zero.
    pub fn settle(&mut self) -> ClientResult<bool> {
        if self.outstanding == 0 {
            return Err(ClientError::JoinMismatch(
                "settled more work than was added".to_owned(),
            ));
        }
        self.outstanding -= 1;
        if self.outstanding == 0 {
            self.completed = true;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}
