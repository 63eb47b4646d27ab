//! Send Receipts
//!
//! A [`Receipt`] travels with a send and comes back to the sender as the
//! content of a `Receipt` event once the transport is done with the data.
//! Disposing it releases the attached garbage (typically the sent buffer
//! sequence) and fires any completion hooks, for example the credit limiter
//! release or a blocked caller's wakeup.

use crate::buffers::BufferSequence;
use std::fmt;

/// Resources released when a receipt is disposed
pub enum Garbage {
    /// Buffers the transport held on behalf of the sender
    Sequence(BufferSequence),
    /// Arbitrary release action
    Release(Box<dyn FnOnce() + Send>),
}

impl Garbage {
    fn release(self) {
        match self {
            Garbage::Sequence(seq) => seq.dispose(),
            Garbage::Release(action) => action(),
        }
    }
}

impl fmt::Debug for Garbage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Garbage::Sequence(seq) => f.debug_tuple("Sequence").field(seq).finish(),
            Garbage::Release(_) => f.write_str("Release"),
        }
    }
}

type Completion = Box<dyn FnOnce(Option<i64>) + Send>;

/// Delivery confirmation token.
///
/// Ownership guarantees single disposal: [`Receipt::dispose`] consumes the
/// receipt. A receipt dropped without disposal (for example after a rejected
/// send) releases its garbage but does not fire completion hooks.
pub struct Receipt {
    timestamp_nanos: i64,
    garbage: Option<Garbage>,
    completion: Option<Completion>,
    result: Option<i64>,
}

impl Receipt {
    /// Receipt carrying a send timestamp; zero or negative means none.
    pub fn new(timestamp_nanos: i64) -> Self {
        Self {
            timestamp_nanos: timestamp_nanos.max(0),
            garbage: None,
            completion: None,
            result: None,
        }
    }

    pub fn untimed() -> Self {
        Self::new(0)
    }

    /// Send timestamp in monotonic nanoseconds, zero when unset
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp_nanos
    }

    pub fn has_timestamp(&self) -> bool {
        self.timestamp_nanos != 0
    }

    /// Attach garbage, releasing any previously attached garbage first
    pub fn set_garbage(&mut self, garbage: Garbage) {
        if let Some(previous) = self.garbage.replace(garbage) {
            previous.release();
        }
    }

    pub fn with_garbage(mut self, garbage: Garbage) -> Self {
        self.set_garbage(garbage);
        self
    }

    pub fn garbage(&self) -> Option<&Garbage> {
        self.garbage.as_ref()
    }

    /// Buffers attached as garbage, e.g. the data returned by a memory read
    pub fn sequence(&self) -> Option<&BufferSequence> {
        match &self.garbage {
            Some(Garbage::Sequence(seq)) => Some(seq),
            _ => None,
        }
    }

    /// Chain a completion hook; hooks run in registration order on disposal
    pub fn on_completion(mut self, hook: impl FnOnce(Option<i64>) + Send + 'static) -> Self {
        self.completion = Some(match self.completion.take() {
            Some(previous) => Box::new(move |result| {
                previous(result);
                hook(result);
            }),
            None => Box::new(hook),
        });
        self
    }

    /// Operation result recorded by a memory bus (prior value, bytes read)
    pub fn set_result(&mut self, result: i64) {
        self.result = Some(result);
    }

    pub fn result(&self) -> Option<i64> {
        self.result
    }

    /// Release garbage and fire completion hooks
    pub fn dispose(mut self) {
        if let Some(garbage) = self.garbage.take() {
            garbage.release();
        }
        if let Some(completion) = self.completion.take() {
            completion(self.result);
        }
    }

    /// Release garbage without firing completion hooks
    pub fn abandon(mut self) {
        self.completion = None;
    }
}

impl Drop for Receipt {
    fn drop(&mut self) {
        if let Some(garbage) = self.garbage.take() {
            garbage.release();
        }
    }
}

impl fmt::Debug for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receipt")
            .field("timestamp_nanos", &self.timestamp_nanos)
            .field("garbage", &self.garbage)
            .field("result", &self.result)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}
