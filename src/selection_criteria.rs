//! Types for describing which servers in a topology are suitable for a given operation.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bson::{doc, Bson, Document};

use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::description::server::ServerDescription,
};

/// A read preference tag set. See the [MongoDB docs](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/)
/// for more details.
pub type TagSet = HashMap<String, String>;

/// A predicate used to filter servers that are considered suitable. A server is considered
/// suitable by a predicate if `predicate(server)` returns true.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerDescription) -> bool>;

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ///
    /// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference/) for
    /// more details.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(Predicate),
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadPreference(rp) => f.debug_tuple("ReadPreference").field(rp).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            (Self::Predicate(p1), Self::Predicate(p2)) => Arc::ptr_eq(p1, p2),
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    pub(crate) fn is_read_pref_primary(&self) -> bool {
        matches!(self, Self::ReadPreference(ReadPreference::Primary))
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.as_read_pref().and_then(|pref| pref.max_staleness())
    }

    /// Build selection criteria that matches only the server at `address`. Used to route an
    /// operation back to the server that started it (e.g. a `getMore`).
    pub fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address == address))
    }
}

/// Specifies how the driver should route a read operation to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to
/// remain eligible for the operation. The max staleness value maps to the
/// `maxStalenessSeconds` MongoDB option and will be sent to the server as an integer number of
/// seconds.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more
/// details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,
    /// Only route this operation to a secondary.
    Secondary {
        tag_sets: Option<Vec<TagSet>>,
        max_staleness: Option<Duration>,
    },
    /// Route this operation to the primary if it's available, but fall back to the secondaries
    /// if not.
    PrimaryPreferred {
        tag_sets: Option<Vec<TagSet>>,
        max_staleness: Option<Duration>,
    },
    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        tag_sets: Option<Vec<TagSet>>,
        max_staleness: Option<Duration>,
    },
    /// Route this operation to the node with the least network latency regardless of whether
    /// it's the primary or a secondary.
    Nearest {
        tag_sets: Option<Vec<TagSet>>,
        max_staleness: Option<Duration>,
    },
}

impl ReadPreference {
    /// Creates a `Secondary` read preference with no tags or max staleness.
    pub fn secondary() -> Self {
        Self::Secondary {
            tag_sets: None,
            max_staleness: None,
        }
    }

    /// Creates a `PrimaryPreferred` read preference with no tags or max staleness.
    pub fn primary_preferred() -> Self {
        Self::PrimaryPreferred {
            tag_sets: None,
            max_staleness: None,
        }
    }

    /// Creates a `SecondaryPreferred` read preference with no tags or max staleness.
    pub fn secondary_preferred() -> Self {
        Self::SecondaryPreferred {
            tag_sets: None,
            max_staleness: None,
        }
    }

    /// Creates a `Nearest` read preference with no tags or max staleness.
    pub fn nearest() -> Self {
        Self::Nearest {
            tag_sets: None,
            max_staleness: None,
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { max_staleness, .. }
            | ReadPreference::PrimaryPreferred { max_staleness, .. }
            | ReadPreference::SecondaryPreferred { max_staleness, .. }
            | ReadPreference::Nearest { max_staleness, .. } => *max_staleness,
        }
    }

    /// Returns a copy of this read preference with the given tag sets applied. Returns an error
    /// if called on `Primary`, since tags cannot be combined with that mode.
    pub fn with_tags(self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let tag_sets = Some(tag_sets);

        let read_pref = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "read preference tags can only be specified when a non-primary \
                              mode is specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { max_staleness, .. } => ReadPreference::Secondary {
                tag_sets,
                max_staleness,
            },
            ReadPreference::PrimaryPreferred { max_staleness, .. } => {
                ReadPreference::PrimaryPreferred {
                    tag_sets,
                    max_staleness,
                }
            }
            ReadPreference::SecondaryPreferred { max_staleness, .. } => {
                ReadPreference::SecondaryPreferred {
                    tag_sets,
                    max_staleness,
                }
            }
            ReadPreference::Nearest { max_staleness, .. } => ReadPreference::Nearest {
                tag_sets,
                max_staleness,
            },
        };

        Ok(read_pref)
    }

    /// Returns a copy of this read preference with the given max staleness applied. Returns an
    /// error if called on `Primary`, since max staleness cannot be combined with that mode.
    pub fn with_max_staleness(self, max_staleness: Duration) -> Result<Self> {
        let max_staleness = Some(max_staleness);

        let read_pref = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "max staleness can only be specified when a non-primary mode is \
                              specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { tag_sets, .. } => ReadPreference::Secondary {
                tag_sets,
                max_staleness,
            },
            ReadPreference::PrimaryPreferred { tag_sets, .. } => {
                ReadPreference::PrimaryPreferred {
                    tag_sets,
                    max_staleness,
                }
            }
            ReadPreference::SecondaryPreferred { tag_sets, .. } => {
                ReadPreference::SecondaryPreferred {
                    tag_sets,
                    max_staleness,
                }
            }
            ReadPreference::Nearest { tag_sets, .. } => ReadPreference::Nearest {
                tag_sets,
                max_staleness,
            },
        };

        Ok(read_pref)
    }

    pub(crate) fn into_document(self) -> Document {
        let (mode, tag_sets, max_staleness) = match self {
            ReadPreference::Primary => ("primary", None, None),
            ReadPreference::PrimaryPreferred {
                tag_sets,
                max_staleness,
            } => ("primaryPreferred", tag_sets, max_staleness),
            ReadPreference::Secondary {
                tag_sets,
                max_staleness,
            } => ("secondary", tag_sets, max_staleness),
            ReadPreference::SecondaryPreferred {
                tag_sets,
                max_staleness,
            } => ("secondaryPreferred", tag_sets, max_staleness),
            ReadPreference::Nearest {
                tag_sets,
                max_staleness,
            } => ("nearest", tag_sets, max_staleness),
        };

        let mut doc = doc! { "mode": mode };

        if let Some(max_stale) = max_staleness {
            doc.insert("maxStalenessSeconds", max_stale.as_secs() as i64);
        }

        if let Some(tag_sets) = tag_sets {
            let tags: Vec<Bson> = tag_sets
                .into_iter()
                .map(|tag_set| {
                    Bson::Document(tag_set.into_iter().map(|(k, v)| (k, v.into())).collect())
                })
                .collect();
            doc.insert("tags", tags);
        }

        doc
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tags_rejected_on_primary() {
        assert!(ReadPreference::Primary.with_tags(vec![]).is_err());
    }

    #[test]
    fn max_staleness_rejected_on_primary() {
        assert!(ReadPreference::Primary
            .with_max_staleness(Duration::from_secs(90))
            .is_err());
    }

    #[test]
    fn into_document_includes_mode_and_tags() {
        let mut tag_set = TagSet::new();
        tag_set.insert("dc".to_string(), "east".to_string());

        let pref = ReadPreference::secondary()
            .with_tags(vec![tag_set])
            .unwrap()
            .with_max_staleness(Duration::from_secs(120))
            .unwrap();

        let doc = pref.into_document();
        assert_eq!(doc.get_str("mode").unwrap(), "secondary");
        assert_eq!(doc.get_i64("maxStalenessSeconds").unwrap(), 120);
        assert!(doc.get_array("tags").is_ok());
    }

    #[test]
    fn selection_criteria_primary_shortcut() {
        let criteria: SelectionCriteria = ReadPreference::Primary.into();
        assert!(criteria.is_read_pref_primary());
        assert_eq!(criteria.max_staleness(), None);
    }
}
