//! Seed derivation and the single pseudo-random stream of a run.
//!
//! Every stochastic decision of every stage and of the packer is a draw from
//! one [`RunRng`]. The stream is owned by the run's context and consumed in
//! stage order, so the same seed and options reproduce byte-identical output.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Name families used by the packer to mix business-like names with random ones.
const ROLE_STATE: &[&str] = &["s", "t", "idx", "n", "k", "State", "Index", "Pos"];
const ROLE_BUFFER: &[&str] = &["buf", "data", "chunk", "blob", "payload", "Content", "Buffer", "Segment"];

/// Deterministic random stream for one run.
pub struct RunRng {
    inner: StdRng,
    seed: i64,
    user_seed: bool,
}

/// Build the run stream.
///
/// With `Some(seed)` the stream is seeded directly from the caller value.
/// With `None` the seed is `hash(input) XOR entropy`; the chosen value is
/// still reported through [`RunRng::seed`] so the run can be replayed.
pub fn init_rng(seed: Option<i64>, input: &str) -> RunRng {
    match seed {
        Some(value) => RunRng::from_seed(value, true),
        None => RunRng::from_seed(input_hash_seed(input) ^ rand::random::<i64>(), false),
    }
}

/// First 8 bytes of SHA-256(input), little-endian.
pub fn input_hash_seed(input: &str) -> i64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_le_bytes(head)
}

impl RunRng {
    pub fn from_seed(seed: i64, user_seed: bool) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed as u64),
            seed,
            user_seed,
        }
    }

    /// The effective seed, echoed in the output footer.
    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn is_user_seed(&self) -> bool {
        self.user_seed
    }

    /// Uniform draw in `0..n`. Returns 0 for `n == 0`.
    pub fn intn(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        self.inner.gen_range(0..n)
    }

    /// Uniform draw in `lo..=hi`.
    pub fn range(&mut self, lo: usize, hi: usize) -> usize {
        if hi <= lo {
            return lo;
        }
        lo + self.intn(hi - lo + 1)
    }

    /// True with probability `percent`/100.
    pub fn chance(&mut self, percent: u8) -> bool {
        self.intn(100) < usize::from(percent)
    }

    /// Non-negative 63-bit draw.
    pub fn int63(&mut self) -> i64 {
        (self.inner.next_u64() >> 1) as i64
    }

    /// Random identifier of `n` letters (at least 2).
    pub fn ident(&mut self, n: usize) -> String {
        let n = n.max(2);
        (0..n)
            .map(|_| LETTERS[self.intn(LETTERS.len())] as char)
            .collect()
    }

    /// Random variable name of 5 to 10 letters.
    pub fn var_name(&mut self, n: usize) -> String {
        let n = n.clamp(5, 10);
        self.ident(n)
    }

    /// Either a role-family name or a random one, half the time each.
    pub fn mixed_state_name(&mut self) -> String {
        if self.intn(2) == 0 {
            ROLE_STATE[self.intn(ROLE_STATE.len())].to_string()
        } else {
            self.var_name(4)
        }
    }

    /// Business-like buffer name, used for decoy variables.
    pub fn buffer_name(&mut self) -> String {
        let base = ROLE_BUFFER[self.intn(ROLE_BUFFER.len())];
        format!("{base}{}", self.ident(3))
    }

    /// Fisher-Yates shuffle, highest index first.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.intn(i + 1);
            items.swap(i, j);
        }
    }
}
