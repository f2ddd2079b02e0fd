//! Request id allocation.
//!
//! Ids 1..=65535 are handed out from a lazily advanced range first, then from a queue of
//! recycled ids. Releasing an id only pushes it onto a bounded release queue; a dedicated
//! recycler thread forwards it to the allocation side, so a releaser never waits on an
//! allocator that is slow to pick ids up.

use crate::error::{Error, Result};

use futures::channel::mpsc;
use futures::executor::block_on;
use futures::StreamExt;

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::thread;

use super::lock;

/// Number of ids available for requests. Id 0 belongs to management records.
pub const REQUEST_ID_SPACE: usize = u16::MAX as usize;

/// How many recycled ids may wait for an allocator before the recycler blocks.
const RECYCLED_BUFFER: usize = 16;

pub struct IdAllocator {
    in_use: Mutex<HashSet<u16>>,
    fresh: Mutex<RangeInclusive<u16>>,
    recycled: Mutex<mpsc::Receiver<u16>>,
    releases: Mutex<mpsc::Sender<u16>>,
}

impl IdAllocator {
    /// Creates an allocator and starts its recycler thread. The thread exits once the
    /// allocator is dropped.
    pub fn new() -> Result<IdAllocator> {
        // Only in-use ids are ever queued, so the release queue cannot overflow.
        let (release_tx, release_rx) = mpsc::channel::<u16>(REQUEST_ID_SPACE);
        let (recycled_tx, recycled_rx) = mpsc::channel::<u16>(RECYCLED_BUFFER);

        thread::Builder::new()
            .name("fastcgi-id-recycler".to_owned())
            .spawn(move || {
                let result = block_on(release_rx.map(Ok::<u16, mpsc::SendError>).forward(recycled_tx));
                debug!("id recycler finished: {:?}", result);
            })?;

        Ok(IdAllocator {
            in_use: Mutex::new(HashSet::new()),
            fresh: Mutex::new(1..=u16::MAX),
            recycled: Mutex::new(recycled_rx),
            releases: Mutex::new(release_tx),
        })
    }

    /// Returns an id that no other in-flight request holds. Blocks while all of them are taken.
    pub fn allocate(&self) -> Result<u16> {
        loop {
            let candidate = match lock(&self.fresh).next() {
                Some(id) => id,
                None => self.next_recycled()?,
            };
            if lock(&self.in_use).insert(candidate) {
                debug!("allocated request id {}", candidate);
                return Ok(candidate);
            }
            debug!("request id {} is still in use, drawing another", candidate);
        }
    }

    fn next_recycled(&self) -> Result<u16> {
        let mut recycled = lock(&self.recycled);
        block_on(recycled.next()).ok_or_else(|| {
            error!("id recycler is gone");
            Error::AllocatorClosed
        })
    }

    /// Marks `id` free and queues it for reuse without blocking. Returns false if the id
    /// was not in use, in which case nothing is queued.
    pub fn release(&self, id: u16) -> bool {
        if !lock(&self.in_use).remove(&id) {
            warn!("request id {} released while not in use", id);
            return false;
        }
        if let Err(e) = lock(&self.releases).try_send(id) {
            error!("request id {} lost, could not queue it for reuse: {}", id, e);
        } else {
            debug!("released request id {}", id);
        }
        true
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        lock(&self.in_use).contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        lock(&self.in_use).len()
    }

    /// Allocates an id that is released again when the returned lease is dropped.
    pub fn lease(self: &Arc<Self>) -> Result<IdLease> {
        Ok(IdLease {
            id: self.allocate()?,
            allocator: Arc::clone(self),
        })
    }
}

/// An allocated request id, released on drop.
pub struct IdLease {
    id: u16,
    allocator: Arc<IdAllocator>,
}

impl IdLease {
    pub fn get(&self) -> u16 {
        self.id
    }
}

impl std::fmt::Debug for IdLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IdLease").field(&self.id).finish()
    }
}

impl Drop for IdLease {
    fn drop(&mut self) {
        self.allocator.release(self.id);
    }
}
