//! Macros for building and returning [`crate::error::StewardError`] values.

/// Creates a [`crate::error::StewardError`] from a kind and a static description.
///
/// Optional dynamic detail (`detail =` moves an owned [`String`], a bare expression is
/// rendered with `to_string`) and an optional `source:` error can follow.
#[macro_export]
macro_rules! steward_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::StewardError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::StewardError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        $crate::error::StewardError::from(($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr, source: $source:expr) => {
        $crate::error::StewardError::from(($kind, $desc, $detail)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::StewardError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::StewardError::from(($kind, $desc, $detail.to_string()))
            .with_source($source)
    };
}

/// Returns early with a [`crate::error::StewardError`].
///
/// Accepts the same arguments as [`steward_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return ::core::result::Result::Err($crate::steward_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::steward_error!($kind, $desc, source: $source))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        return ::core::result::Result::Err($crate::steward_error!($kind, $desc, detail = $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return ::core::result::Result::Err($crate::steward_error!($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::steward_error!(
            $kind,
            $desc,
            $detail,
            source: $source
        ))
    };
}
