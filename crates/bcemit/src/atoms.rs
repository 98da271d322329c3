//! Literal table shared by name, string, number and switch-case operands.
//!
//! Literals are deduplicated and indexed in first-use order; the index is what
//! appears in the bytecode as a u16 immediate.

use ahash::RandomState;
use indexmap::IndexSet;

use crate::{
    error::{EmitError, EmitResult},
    limits::MAX_LITERALS,
};

/// A constant referenced from bytecode by index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Literal {
    /// An identifier or string constant.
    String(Box<str>),
    /// A number that has no immediate encoding, stored as its IEEE-754 bits
    /// so that it can be hashed.
    Number(u64),
    /// `true` or `false` as a switch-case key.
    Bool(bool),
    /// `null` as a switch-case key.
    Null,
}

impl Literal {
    #[must_use]
    pub fn number(value: f64) -> Self {
        Self::Number(value.to_bits())
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

/// Insertion-ordered, deduplicated literal list for one compilation unit.
#[derive(Debug, Clone)]
pub(crate) struct AtomList {
    set: IndexSet<Literal, RandomState>,
    limit: usize,
}

impl AtomList {
    pub fn new(limit: usize) -> Self {
        Self {
            set: IndexSet::with_hasher(RandomState::new()),
            limit: limit.min(MAX_LITERALS),
        }
    }

    /// Returns the index of `literal`, adding it if this is its first use.
    pub fn index_of(&mut self, literal: Literal) -> EmitResult<u16> {
        if let Some(index) = self.set.get_index_of(&literal) {
            return u16::try_from(index).map_err(|_| EmitError::TooManyLiterals);
        }
        if self.set.len() >= self.limit {
            return Err(EmitError::TooManyLiterals);
        }
        self.set.try_reserve(1)?;
        let (index, _) = self.set.insert_full(literal);
        u16::try_from(index).map_err(|_| EmitError::TooManyLiterals)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn into_vec(self) -> Vec<Literal> {
        self.set.into_iter().collect()
    }
}
