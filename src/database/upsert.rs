//! # Upsert Conflict Targets
//!
//! The pending-row uniqueness rules in this substrate are partial unique
//! indexes, and a partial unique index has no backing named constraint
//! object. An upsert written as `ON CONFLICT ON CONSTRAINT name` against one
//! parses fine and then fails at the first real conflict at runtime. This
//! type rules that form out: a [`ConflictTarget`] can only be built from a
//! column list, optionally with the index predicate, so every upsert in the
//! crate renders to `ON CONFLICT (cols) WHERE predicate`.

/// Conflict target for an `INSERT ... ON CONFLICT` statement.
///
/// There is deliberately no constructor taking a constraint name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictTarget {
    columns: &'static [&'static str],
    predicate: Option<&'static str>,
}

impl ConflictTarget {
    /// Target a full unique index by its column list.
    pub const fn columns(columns: &'static [&'static str]) -> Self {
        Self {
            columns,
            predicate: None,
        }
    }

    /// Target a partial unique index by its column list and `WHERE` predicate.
    pub const fn partial_index(
        columns: &'static [&'static str],
        predicate: &'static str,
    ) -> Self {
        Self {
            columns,
            predicate: Some(predicate),
        }
    }

    /// Render the conflict target for interpolation after `ON CONFLICT`.
    pub fn render(&self) -> String {
        let cols = self.columns.join(", ");
        match self.predicate {
            Some(predicate) => format!("({cols}) WHERE {predicate}"),
            None => format!("({cols})"),
        }
    }
}

impl std::fmt::Display for ConflictTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Which branch an idempotent upsert took. Callers and tests assert on the
/// branch directly instead of inferring it from side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A fresh pending row was inserted.
    Inserted(i64),
    /// The call coalesced into an existing pending row.
    Merged(i64),
}

impl UpsertOutcome {
    pub fn from_row(id: i64, inserted: bool) -> Self {
        if inserted {
            Self::Inserted(id)
        } else {
            Self::Merged(id)
        }
    }

    /// Id of the affected row, whichever branch was taken.
    pub fn id(&self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Merged(id) => *id,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged(_))
    }
}
