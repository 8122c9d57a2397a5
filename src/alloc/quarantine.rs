//! Freed blocks wait here before their memory goes back to the heap, so that
//! a use-after-free hits a block nobody else owns yet.

use std::collections::VecDeque;

use hashbrown::HashMap;

use super::chunk::Chunk;
use crate::Addr;

/// FIFO of freed chunks bounded by total payload bytes.
#[derive(Debug)]
pub struct Quarantine {
    queue: VecDeque<Chunk>,
    /// How many queued chunks start at each base.
    bases: HashMap<Addr, usize, ahash::RandomState>,
    volume: usize,
    budget: usize,
}

impl Quarantine {
    pub fn new(budget: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            bases: HashMap::default(),
            volume: 0,
            budget,
        }
    }

    /// Sum of the payload sizes of every queued chunk. Never exceeds
    /// [`Quarantine::budget`] between calls.
    pub fn volume(&self) -> usize {
        self.volume
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue `chunk`, then evict oldest-first until the volume fits the
    /// budget again. The evicted chunks are returned for physical release; a
    /// chunk bigger than the whole budget is evicted straight away.
    #[must_use = "evicted chunks still own heap memory"]
    pub fn enqueue(&mut self, chunk: Chunk) -> Vec<Chunk> {
        self.volume += chunk.size;
        *self.bases.entry(chunk.base).or_default() += 1;
        self.queue.push_back(chunk);
        let mut evicted = Vec::new();
        while self.volume > self.budget {
            let Some(oldest) = self.queue.pop_front() else {
                break;
            };
            self.volume -= oldest.size;
            self.forget(oldest.base);
            evicted.push(oldest);
        }
        evicted
    }

    fn forget(&mut self, base: Addr) {
        if let Some(n) = self.bases.get_mut(&base) {
            *n -= 1;
            if *n == 0 {
                self.bases.remove(&base);
            }
        }
    }

    /// `true` if a chunk based at `base` is still queued.
    pub fn contains(&self, base: Addr) -> bool {
        self.bases.contains_key(&base)
    }

    /// The most recently freed queued chunk whose payload contains `addr`.
    pub fn find_containing(&self, addr: Addr) -> Option<&Chunk> {
        self.queue.iter().rev().find(|chunk| chunk.contains(addr))
    }

    /// Empty the queue, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Chunk> + '_ {
        self.volume = 0;
        self.bases.clear();
        self.queue.drain(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.queue.iter()
    }
}
