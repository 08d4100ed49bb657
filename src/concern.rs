//! Write concern: how many nodes (or which tag) must acknowledge a write before the driver
//! considers it successful.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson_util,
    error::{Error, Result},
};

/// Specifies the level of acknowledgement requested from the server for write operations (§6
/// "Configuration options").
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WriteConcern {
    /// Requests acknowledgement that the operation has propagated to a specific number or
    /// variety of servers. `w: Nodes(0)` requests no acknowledgement at all (§4.H).
    #[builder(default)]
    pub w: Option<Acknowledgment>,

    /// A time limit for the write concern; the server returns an error (not a rollback) if the
    /// write hasn't propagated to the requested level within it.
    #[builder(default)]
    #[serde(rename = "wtimeout")]
    #[serde(serialize_with = "bson_util::serialize_duration_as_i64_millis")]
    #[serde(deserialize_with = "bson_util::deserialize_duration_from_u64_millis")]
    #[serde(default)]
    pub w_timeout: Option<Duration>,

    /// Requests acknowledgement that the operation has propagated to the on-disk journal.
    #[builder(default)]
    #[serde(rename = "j")]
    pub journal: Option<bool>,
}

/// The type of the `w` field in a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq)]
pub enum Acknowledgment {
    /// Requires acknowledgement that the write has reached this many nodes. `0` means no
    /// acknowledgement is requested.
    Nodes(i32),

    /// Requires acknowledgement that the write has reached the majority of nodes.
    Majority,

    /// Requires acknowledgement according to the given write tag (see the
    /// [tag set docs](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/#tag-sets-and-custom-write-concern-behavior)).
    Tag(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Acknowledgment::Majority => serializer.serialize_str("majority"),
            Acknowledgment::Nodes(n) => serializer.serialize_i32(*n),
            Acknowledgment::Tag(tag) => serializer.serialize_str(tag),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IntOrString {
            Int(i32),
            String(String),
        }

        match IntOrString::deserialize(deserializer)? {
            IntOrString::String(s) => Ok(s.into()),
            IntOrString::Int(i) => Ok(i.into()),
        }
    }
}

impl From<i32> for Acknowledgment {
    fn from(i: i32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            Acknowledgment::Tag(s)
        }
    }
}

impl WriteConcern {
    /// A write concern requesting no acknowledgement whatsoever.
    pub fn unacknowledged() -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(0)),
            ..Default::default()
        }
    }

    /// Whether this write concern requires any acknowledgement at all (§4.H: `w == 0` is the
    /// unacknowledged, fire-and-forget case).
    pub(crate) fn is_acknowledged(&self) -> bool {
        !matches!(self.w, Some(Acknowledgment::Nodes(0))) || self.journal == Some(true)
    }

    /// Validates that `w = 0` isn't combined with `j = true` (the server would reject that
    /// combination outright) and that a numeric `w` isn't negative.
    pub fn validate(&self) -> Result<()> {
        if let Some(Acknowledgment::Nodes(i)) = self.w {
            if i < 0 {
                return Err(Error::invalid_argument(
                    "write concern `w` field cannot be a negative integer",
                ));
            }
        }

        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(Error::invalid_argument(
                "write concern cannot have w=0 and j=true",
            ));
        }

        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.w.is_none() && self.w_timeout.is_none() && self.journal.is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unacknowledged_is_not_acknowledged() {
        assert!(!WriteConcern::unacknowledged().is_acknowledged());
    }

    #[test]
    fn default_is_acknowledged() {
        assert!(WriteConcern::default().is_acknowledged());
    }

    #[test]
    fn w0_and_journal_true_is_invalid() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Nodes(0)),
            journal: Some(true),
            ..Default::default()
        };
        assert!(wc.validate().is_err());
    }

    #[test]
    fn negative_w_is_invalid() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Nodes(-1)),
            ..Default::default()
        };
        assert!(wc.validate().is_err());
    }
}
