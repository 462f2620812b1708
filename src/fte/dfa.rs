//! DFA ranking
//!
//! Bijective map between integers `[0, |L(R) ∩ Σⁿ|)` and the strings of
//! length `n` in the regular language `L(R)`, ordered lexicographically by
//! byte value.
//!
//! The regex is compiled to an anchored, minimised dense DFA and the word
//! counts `T[q][k]` (accepted strings of length `k` starting from state `q`)
//! are tabulated bottom-up. Ranking walks the string accumulating the counts
//! of all lexicographically-smaller prefixes; unranking inverts the walk by
//! choosing, at each position, the smallest byte whose cumulative count
//! exceeds the residual. Counts are exponential in `n`, so everything runs
//! on `BigUint`s.

use crate::error::{Error, Result};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use regex_automata::dfa::{dense, Automaton, StartKind};
use regex_automata::util::primitives::StateID;
use regex_automata::{Anchored, Input};
use std::collections::HashMap;

/// A ranker for strings of length `n` in a regular language
pub struct Dfa {
    regex: String,
    n: usize,
    /// Per-state transition row: byte -> state index
    rows: Vec<[u32; 256]>,
    /// `table[q][k]` = number of accepted words of length `k` from state `q`;
    /// state 0 is the start state
    table: Vec<Vec<BigUint>>,
}

impl std::fmt::Debug for Dfa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dfa")
            .field("regex", &self.regex)
            .field("n", &self.n)
            .field("states", &self.rows.len())
            .finish()
    }
}

impl Dfa {
    /// Compile `regex` and tabulate word counts for lengths `0..=n`
    pub fn new(regex: &str, n: usize) -> Result<Self> {
        let bad = |e: &dyn std::fmt::Display| Error::InvalidRegex(regex.into(), e.to_string());

        let dfa = dense::Builder::new()
            .configure(dense::Config::new().start_kind(StartKind::Anchored).minimize(true))
            .build(regex)
            .map_err(|e| bad(&e))?;
        let start = dfa
            .start_state_forward(&Input::new("").anchored(Anchored::Yes))
            .map_err(|e| bad(&e))?;

        // Enumerate reachable states breadth-first; index 0 is the start.
        let mut states: Vec<StateID> = vec![start];
        let mut index: HashMap<StateID, u32> = HashMap::from([(start, 0)]);
        let mut head = 0;
        while head < states.len() {
            let q = states[head];
            head += 1;
            if dfa.is_dead_state(q) || dfa.is_quit_state(q) {
                continue;
            }
            for b in 0..=255u8 {
                let next = dfa.next_state(q, b);
                index.entry(next).or_insert_with(|| {
                    states.push(next);
                    (states.len() - 1) as u32
                });
            }
        }

        let mut rows = Vec::with_capacity(states.len());
        for &q in &states {
            let mut row = [0u32; 256];
            if dfa.is_dead_state(q) || dfa.is_quit_state(q) {
                row = [index[&q]; 256];
            } else {
                for b in 0..=255usize {
                    row[b] = index[&dfa.next_state(q, b as u8)];
                }
            }
            rows.push(row);
        }

        // Group each row by successor so a layer costs one multiply per
        // distinct target instead of 256 additions.
        let grouped: Vec<Vec<(u32, u32)>> = rows
            .iter()
            .map(|row| {
                let mut mult: HashMap<u32, u32> = HashMap::new();
                for &j in row.iter() {
                    *mult.entry(j).or_insert(0) += 1;
                }
                let mut pairs: Vec<(u32, u32)> = mult.into_iter().collect();
                pairs.sort_unstable();
                pairs
            })
            .collect();

        // T[q][0] = 1 iff q accepts at end of input.
        let mut table: Vec<Vec<BigUint>> = states
            .iter()
            .map(|&q| {
                let accepts = dfa.is_match_state(dfa.next_eoi_state(q));
                vec![if accepts { BigUint::one() } else { BigUint::zero() }]
            })
            .collect();

        for k in 1..=n {
            let layer: Vec<BigUint> = grouped
                .iter()
                .map(|pairs| {
                    let mut total = BigUint::zero();
                    for &(j, mult) in pairs {
                        let prev = &table[j as usize][k - 1];
                        if !prev.is_zero() {
                            total += prev * mult;
                        }
                    }
                    total
                })
                .collect();
            for (q, count) in layer.into_iter().enumerate() {
                table[q].push(count);
            }
        }

        Ok(Self { regex: regex.into(), n, rows, table })
    }

    /// Target string length
    pub fn msg_len(&self) -> usize {
        self.n
    }

    /// Number of accepted words of length exactly `n`
    pub fn language_size(&self) -> &BigUint {
        &self.table[0][self.n]
    }

    /// `⌊log₂ |L(R) ∩ Σⁿ|⌋`, in bits
    pub fn capacity(&self) -> Result<usize> {
        let size = self.language_size();
        if size.is_zero() {
            return Err(Error::CapacityTooSmall { regex: self.regex.clone(), msg_len: self.n });
        }
        Ok((size.bits() - 1) as usize)
    }

    /// Number of accepted words of length exactly `k`, for `k <= n`
    pub fn num_words_in_slice(&self, k: usize) -> Result<BigUint> {
        if k > self.n {
            return Err(Error::RankOutOfRange);
        }
        Ok(self.table[0][k].clone())
    }

    /// Map a length-`n` word of the language to its rank
    pub fn rank(&self, s: &[u8]) -> Result<BigUint> {
        if s.len() != self.n {
            return Err(Error::NotInLanguage);
        }

        let mut rank = BigUint::zero();
        let mut q = 0usize;
        for (i, &b) in s.iter().enumerate() {
            let remaining = self.n - i - 1;
            for c in 0..b {
                let j = self.rows[q][c as usize] as usize;
                let count = &self.table[j][remaining];
                if !count.is_zero() {
                    rank += count;
                }
            }
            q = self.rows[q][b as usize] as usize;
            if self.table[q][remaining].is_zero() {
                return Err(Error::NotInLanguage);
            }
        }
        Ok(rank)
    }

    /// Map a rank back to its length-`n` word
    pub fn unrank(&self, rank: &BigUint) -> Result<Vec<u8>> {
        if rank >= self.language_size() {
            return Err(Error::RankOutOfRange);
        }

        let mut residual = rank.clone();
        let mut out = Vec::with_capacity(self.n);
        let mut q = 0usize;
        for i in 0..self.n {
            let remaining = self.n - i - 1;
            let mut chosen = None;
            for b in 0..=255u8 {
                let j = self.rows[q][b as usize] as usize;
                let count = &self.table[j][remaining];
                if count.is_zero() {
                    continue;
                }
                if &residual < count {
                    chosen = Some((b, j));
                    break;
                }
                residual -= count;
            }
            match chosen {
                Some((b, j)) => {
                    out.push(b);
                    q = j;
                }
                // Unreachable given the range check above.
                None => return Err(Error::RankOutOfRange),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_words() {
        let dfa = Dfa::new("^(a|b)+$", 3).unwrap();
        assert_eq!(dfa.num_words_in_slice(3).unwrap(), BigUint::from(8u32));
        assert_eq!(dfa.num_words_in_slice(1).unwrap(), BigUint::from(2u32));
        assert_eq!(dfa.num_words_in_slice(0).unwrap(), BigUint::zero());
    }

    #[test]
    fn test_unrank_endpoints() {
        let dfa = Dfa::new("^(a|b)+$", 3).unwrap();
        assert_eq!(dfa.unrank(&BigUint::zero()).unwrap(), b"aaa");
        assert_eq!(dfa.unrank(&BigUint::from(7u32)).unwrap(), b"bbb");
        assert!(matches!(dfa.unrank(&BigUint::from(8u32)), Err(Error::RankOutOfRange)));
    }

    #[test]
    fn test_rank_unrank_round_trip() {
        let dfa = Dfa::new("^(a|b|c)+$", 5).unwrap();
        let total = dfa.num_words_in_slice(5).unwrap();
        assert_eq!(total, BigUint::from(243u32));

        let mut r = BigUint::zero();
        while r < total {
            let word = dfa.unrank(&r).unwrap();
            assert_eq!(dfa.rank(&word).unwrap(), r);
            r += BigUint::one();
        }
    }

    #[test]
    fn test_unrank_is_lexicographic() {
        let dfa = Dfa::new("^(a|b)+$", 2).unwrap();
        let words: Vec<Vec<u8>> = (0..4u32)
            .map(|r| dfa.unrank(&BigUint::from(r)).unwrap())
            .collect();
        assert_eq!(words, vec![b"aa".to_vec(), b"ab".to_vec(), b"ba".to_vec(), b"bb".to_vec()]);
    }

    #[test]
    fn test_rank_rejects_non_members() {
        let dfa = Dfa::new("^(a|b)+$", 3).unwrap();
        assert!(matches!(dfa.rank(b"abz"), Err(Error::NotInLanguage)));
        assert!(matches!(dfa.rank(b"ab"), Err(Error::NotInLanguage)));
    }

    #[test]
    fn test_capacity() {
        // 2^8 words of length 8 over {a, b}: capacity is exactly 8 bits.
        let dfa = Dfa::new("^(a|b)+$", 8).unwrap();
        assert_eq!(dfa.capacity().unwrap(), 8);
    }

    #[test]
    fn test_empty_slice_has_no_capacity() {
        // (ab)+ has no words of odd length.
        let dfa = Dfa::new("^(ab)+$", 7).unwrap();
        assert!(matches!(dfa.capacity(), Err(Error::CapacityTooSmall { .. })));
    }

    #[test]
    fn test_fixed_length_subset() {
        // Words of length 4 in a{2,4}b* : aabb, aaab, aaaa.
        let dfa = Dfa::new("^a{2,4}b*$", 4).unwrap();
        assert_eq!(dfa.num_words_in_slice(4).unwrap(), BigUint::from(3u32));
        assert_eq!(dfa.unrank(&BigUint::zero()).unwrap(), b"aaaa");
        assert_eq!(dfa.unrank(&BigUint::from(1u32)).unwrap(), b"aaab");
        assert_eq!(dfa.unrank(&BigUint::from(2u32)).unwrap(), b"aabb");
    }

    #[test]
    fn test_invalid_regex() {
        assert!(matches!(Dfa::new("^(a|$", 4), Err(Error::InvalidRegex(..))));
    }
}
