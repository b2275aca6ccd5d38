//! Macros for defining typed ID types.

/// Macro to define a caller-assigned named ID.
///
/// Named IDs are chosen by the master or by frameworks (framework, executor
/// and task names), so they are validated newtypes over `String` rather than
/// generated values. Validation rejects empty strings, over-long strings and
/// characters that would be unsafe in an on-disk path component.
///
/// # Example
///
/// ```ignore
/// define_name_id!(FrameworkId);
///
/// let id: FrameworkId = "analytics-01".parse()?;
/// ```
#[macro_export]
macro_rules! define_name_id {
    ($name:ident) => {
        /// A typed, caller-assigned identifier.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Maximum length in bytes.
            pub const MAX_LEN: usize = 255;

            /// Validates and wraps a raw identifier.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                if s.len() > Self::MAX_LEN {
                    return Err($crate::IdError::TooLong {
                        len: s.len(),
                        max: Self::MAX_LEN,
                    });
                }

                // IDs become path components under the work and meta
                // directories, so the character set is restricted.
                for ch in s.chars() {
                    if !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')) {
                        return Err($crate::IdError::InvalidCharacter(ch));
                    }
                }

                Ok(Self(s.to_string()))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Macro to define a generated, ULID-backed ID with a type prefix.
///
/// Generated IDs are minted by the agent itself: one per executor run, one
/// per status update. The canonical form is `{prefix}_{ulid}`, which keeps
/// them sortable, unique and recognizable in logs and on disk.
#[macro_export]
macro_rules! define_ulid_id {
    ($name:ident, $prefix:literal) => {
        /// A typed, generated identifier.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a fresh ID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Parses an ID from its `{prefix}_{ulid}` form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                // Peel `{prefix}_` off the front; when that fails, work out
                // which half was wrong so the error is actually usable.
                let Some(ulid_str) = s
                    .strip_prefix(Self::PREFIX)
                    .and_then(|rest| rest.strip_prefix('_'))
                else {
                    return Err(match s.split_once('_') {
                        Some((prefix, _)) => $crate::IdError::InvalidPrefix {
                            expected: Self::PREFIX,
                            actual: prefix.to_string(),
                        },
                        None => $crate::IdError::MissingSeparator,
                    });
                };

                match ulid_str.parse::<$crate::Ulid>() {
                    Ok(ulid) => Ok(Self(ulid)),
                    Err(e) => Err($crate::IdError::InvalidUlid(e.to_string())),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(Self::PREFIX)?;
                f.write_str("_")?;
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                // Routes through Display, skipping the intermediate String.
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct IdVisitor;

                impl<'v> serde::de::Visitor<'v> for IdVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                        write!(f, "a string of the form {}_<ulid>", $name::PREFIX)
                    }

                    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<$name, E> {
                        $name::parse(v).map_err(E::custom)
                    }
                }

                deserializer.deserialize_str(IdVisitor)
            }
        }
    };
}
