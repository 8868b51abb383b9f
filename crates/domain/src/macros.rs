//! Macro for implementing Display and FromStr for status enums
//!
//! Record states, error kinds and backend names are persisted and configured
//! as lowercase strings. This macro keeps both directions of that mapping in
//! one place.
//!
//! # Example
//!
//! ```rust
//! use genguard_domain::impl_domain_status_conversions;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum LeaseStatus {
//!     Held,
//!     Expired,
//! }
//!
//! impl_domain_status_conversions!(LeaseStatus {
//!     Held => "held",
//!     Expired => "expired",
//! });
//! ```

/// Implements Display and FromStr traits for status enums
///
/// - Display writes the mapped string
/// - FromStr parses case-insensitively and reports the enum name on failure
#[macro_export]
macro_rules! impl_domain_status_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $str),)+
                }
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}
