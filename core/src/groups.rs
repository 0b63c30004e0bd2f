//! Rebuild groups.
//!
//! Every transition is tagged with the groups it affects, and every
//! subscriber declares the groups it is interested in. The same [`Groups`]
//! type serves both sides; [`Groups::accepts`] is the delivery rule.
//!
//! | Subscriber interest | Transition groups | Delivered |
//! |---------------------|-------------------|-----------|
//! | explicitly empty    | anything          | no        |
//! | `All`               | anything          | yes       |
//! | named               | `All`             | yes       |
//! | named               | named             | iff the sets intersect |

use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Name of a rebuild group
pub type GroupName = Arc<str>;

/// A set of group names, or the wildcard "all groups".
///
/// Named sets are kept sorted and deduplicated so that equality is set equality.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub enum Groups {
    /// Wildcard: every group
    #[default]
    All,

    /// An explicit set of groups; an empty set opts out of delivery entirely
    Named(SmallVec<[GroupName; 4]>),
}

impl Groups {
    /// The wildcard set
    #[must_use]
    pub const fn all() -> Self {
        Self::All
    }

    /// The explicitly empty set
    #[must_use]
    pub fn none() -> Self {
        Self::Named(SmallVec::new())
    }

    /// A named set
    #[must_use]
    pub fn named<I, N>(names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<GroupName>,
    {
        let mut names: SmallVec<[GroupName; 4]> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self::Named(names)
    }

    /// Whether this is the wildcard
    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Whether this is an explicitly empty named set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Named(names) if names.is_empty())
    }

    /// Whether the set contains `name` (the wildcard contains everything)
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(names) => names.iter().any(|n| &**n == name),
        }
    }

    /// Whether the two sets share a group, treating the wildcard as matching anything
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => true,
            (Self::Named(left), Self::Named(right)) => {
                left.iter().any(|name| right.contains(name))
            },
        }
    }

    /// Delivery rule: does a subscriber with this interest receive a
    /// transition tagged with `transition`?
    #[must_use]
    pub fn accepts(&self, transition: &Self) -> bool {
        if self.is_empty() {
            return false;
        }
        self.intersects(transition)
    }

    /// Iterate over named groups (empty for the wildcard)
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let names: &[GroupName] = match self {
            Self::All => &[],
            Self::Named(names) => names.as_slice(),
        };
        names.iter().map(|n| &**n)
    }
}

impl fmt::Debug for Groups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "Groups::All"),
            Self::Named(names) => f.debug_set().entries(names.iter()).finish(),
        }
    }
}

impl From<&str> for Groups {
    fn from(name: &str) -> Self {
        Self::named([name])
    }
}

impl<const N: usize> From<[&str; N]> for Groups {
    fn from(names: [&str; N]) -> Self {
        Self::named(names)
    }
}

impl<N: Into<GroupName>> FromIterator<N> for Groups {
    fn from_iter<I: IntoIterator<Item = N>>(iter: I) -> Self {
        Self::named(iter)
    }
}
