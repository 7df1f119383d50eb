//! Macros for defining typed ID types.

/// Macro to define a typed, UUID-backed ID.
///
/// This generates a newtype wrapper around a v4 UUID with:
/// - `new()` to generate a fresh random ID
/// - `parse()` to parse from the hyphenated string form
/// - `from_bytes()` / `as_bytes()` for the raw 16-byte form
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations (string form)
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(WorkerId);
///
/// let id = WorkerId::new();
/// let parsed: WorkerId = "3f0c9a6e-8d1b-4c52-9a57-2c6c1f0e4b7d".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            /// Length of the raw byte form.
            pub const RAW_LEN: usize = 16;

            /// Creates a new ID from a fresh random UUID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            /// Creates an ID from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> $crate::Uuid {
                self.0
            }

            /// Creates an ID from its raw 16-byte form.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self($crate::Uuid::from_bytes(bytes))
            }

            /// Creates an ID from a byte slice that must be exactly 16 bytes.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, $crate::IdError> {
                let raw: [u8; 16] =
                    bytes
                        .try_into()
                        .map_err(|_| $crate::IdError::InvalidLength {
                            expected: Self::RAW_LEN,
                            actual: bytes.len(),
                        })?;
                Ok(Self::from_bytes(raw))
            }

            /// Returns the raw 16-byte form.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Parses an ID from its hyphenated string form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let uuid = $crate::Uuid::try_parse(s)
                    .map_err(|e| $crate::IdError::InvalidUuid(e.to_string()))?;

                Ok(Self(uuid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
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

        impl AsRef<$crate::Uuid> for $name {
            fn as_ref(&self) -> &$crate::Uuid {
                &self.0
            }
        }
    };
}
