//! Randomized, exhaustive-without-replacement candidate selection
//!
//! A [`Shuffle`] hands out every candidate exactly once per cycle, in a fresh
//! random order each cycle. Probing walks the cluster this way so the time to
//! visit every peer is bounded by one cycle rather than left to chance.

use crate::{GossipError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Cyclic random permutation over a candidate set
pub struct Shuffle<T> {
    candidates: Vec<T>,
    positions: HashMap<T, usize>,
    deck: Vec<T>,
    rng: StdRng,
}

impl<T> Shuffle<T>
where
    T: Clone + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a shuffle with a deterministic order, for simulations and tests
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            candidates: Vec::new(),
            positions: HashMap::new(),
            deck: Vec::new(),
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.positions.contains_key(item)
    }

    /// Add a candidate. Returns false if it was already present.
    ///
    /// The new candidate joins the current cycle at a random position.
    pub fn add(&mut self, item: T) -> bool {
        if self.positions.contains_key(&item) {
            return false;
        }

        self.positions.insert(item.clone(), self.candidates.len());
        self.candidates.push(item.clone());
        if !self.deck.is_empty() {
            let at = self.rng.gen_range(0..=self.deck.len());
            self.deck.insert(at, item);
        }
        true
    }

    /// Remove a candidate from the set and from the current cycle
    pub fn discard(&mut self, item: &T) -> Result<()> {
        let index = self
            .positions
            .remove(item)
            .ok_or_else(|| GossipError::NotFound(format!("shuffle candidate {:?}", item)))?;

        self.candidates.swap_remove(index);
        if let Some(moved) = self.candidates.get(index) {
            self.positions.insert(moved.clone(), index);
        }
        self.deck.retain(|queued| queued != item);
        Ok(())
    }

    /// Draw the next candidate, starting a new cycle when the current one is spent
    pub fn choice(&mut self) -> Option<T> {
        if self.deck.is_empty() {
            if self.candidates.is_empty() {
                return None;
            }
            self.deck = self.candidates.clone();
            self.deck.shuffle(&mut self.rng);
        }
        self.deck.pop()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.candidates.iter()
    }
}

impl<T> Default for Shuffle<T>
where
    T: Clone + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Decides whether a handle held by a [`WeakShuffle`] still refers to something
pub trait Resolve<H> {
    fn is_live(&self, handle: &H) -> bool;
}

/// A shuffle over handles that may go stale.
///
/// Handles whose target has been dropped are discarded when drawn, so pruned
/// members stop being chosen without an explicit removal call.
pub struct WeakShuffle<H> {
    inner: Shuffle<H>,
}

impl<H> WeakShuffle<H>
where
    H: Clone + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            inner: Shuffle::new(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Shuffle::with_seed(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn add(&mut self, handle: H) -> bool {
        self.inner.add(handle)
    }

    pub fn discard(&mut self, handle: &H) -> Result<()> {
        self.inner.discard(handle)
    }

    /// Draw the next live handle, dropping stale ones along the way
    pub fn choice<R: Resolve<H>>(&mut self, resolver: &R) -> Option<H> {
        while let Some(handle) = self.inner.choice() {
            if resolver.is_live(&handle) {
                return Some(handle);
            }
            // Drawn from the candidate set, so it is always present
            let _ = self.inner.discard(&handle);
        }
        None
    }

    /// Draw up to `count` distinct live handles accepted by `filter`
    pub fn choose<R, F>(&mut self, resolver: &R, count: usize, mut filter: F) -> Vec<H>
    where
        R: Resolve<H>,
        F: FnMut(&H) -> bool,
    {
        let mut chosen = Vec::with_capacity(count);
        // One full cycle at most, so a sparse filter cannot spin
        for _ in 0..self.inner.len() {
            if chosen.len() >= count {
                break;
            }
            match self.choice(resolver) {
                Some(handle) if filter(&handle) && !chosen.contains(&handle) => {
                    chosen.push(handle)
                }
                Some(_) => {}
                None => break,
            }
        }
        chosen
    }

    /// Drop every stale handle
    pub fn prune<R: Resolve<H>>(&mut self, resolver: &R) -> usize {
        let stale: Vec<H> = self
            .inner
            .iter()
            .filter(|handle| !resolver.is_live(handle))
            .cloned()
            .collect();
        for handle in &stale {
            let _ = self.inner.discard(handle);
        }
        stale.len()
    }
}

impl<H> Default for WeakShuffle<H>
where
    H: Clone + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
