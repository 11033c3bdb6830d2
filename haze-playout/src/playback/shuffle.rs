//! Shuffle order
//!
//! A deck is a random permutation of a playlist's indices. When one deck is
//! used up the next is drawn; the last `carry_over` entries of the previous
//! deck are kept away from the head of the new one, so a track never plays
//! twice in a row across a deck boundary.
//!
//! Decks are appended lazily as positions are requested, so looking a few
//! tracks ahead across a boundary works the same as inside a deck.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

#[derive(Debug, Clone)]
pub struct ShuffleDeck {
    len: usize,
    carry_over: usize,
    /// Current deck followed by any decks drawn ahead
    order: Vec<usize>,
    /// Tail of the most recently drawn deck
    last_tail: Vec<usize>,
}

impl ShuffleDeck {
    /// Draw the first deck for a playlist of `len` tracks
    pub fn new(len: usize, carry_over: usize, rng: &mut StdRng) -> Self {
        let mut deck = Self {
            len,
            carry_over: carry_over.min(len / 2),
            order: Vec::with_capacity(len),
            last_tail: Vec::new(),
        };
        deck.draw(rng);
        deck
    }

    /// Draw the first deck with `first` at its head (keeps the playing track in place)
    pub fn starting_with(len: usize, carry_over: usize, first: usize, rng: &mut StdRng) -> Self {
        let mut deck = Self::new(len, carry_over, rng);
        if let Some(at) = deck.order.iter().position(|&i| i == first) {
            deck.order.swap(0, at);
            deck.remember_tail();
        }
        deck
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Playlist index at `position`, drawing further decks as needed
    pub fn index_at(&mut self, position: usize, rng: &mut StdRng) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        while position >= self.order.len() {
            self.draw(rng);
        }
        self.order.get(position).copied()
    }

    /// First position at or after `from` holding `index`, else the first anywhere
    pub fn position_of(&self, index: usize, from: usize) -> Option<usize> {
        let from = from.min(self.order.len());
        self.order[from..]
            .iter()
            .position(|&i| i == index)
            .map(|p| p + from)
            .or_else(|| self.order.iter().position(|&i| i == index))
    }

    /// Drop fully played decks ahead of `position`; returns the adjusted position
    pub fn compact(&mut self, mut position: usize) -> usize {
        while self.len > 0 && position >= self.len && self.order.len() > self.len {
            self.order.drain(..self.len);
            position -= self.len;
        }
        position
    }

    fn draw(&mut self, rng: &mut StdRng) {
        let mut deck: Vec<usize> = (0..self.len).collect();
        deck.shuffle(rng);

        if !self.last_tail.is_empty() {
            if let Some(at) = deck.iter().position(|i| !self.last_tail.contains(i)) {
                deck.swap(0, at);
            }
        }

        self.order.extend_from_slice(&deck);
        self.remember_tail();
    }

    fn remember_tail(&mut self) {
        let start = self.order.len().saturating_sub(self.carry_over);
        self.last_tail = self.order[start..].to_vec();
    }
}
