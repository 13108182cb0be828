//! Debug assertion macros for ring-index invariants.
//!
//! Indices are modular: `rp`, `wp` and the peek cursor all live in
//! `[0, capacity)` with `capacity = token_num + 1` and one slot always left
//! empty. The macros are only active in debug builds, so there is zero
//! overhead on the release fast path.

/// Assert that a ring index is inside its modular domain.
///
/// **Invariant**: `0 <= idx < capacity`
macro_rules! debug_assert_ring_index {
    ($name:literal, $idx:expr, $cap:expr) => {
        debug_assert!(
            $idx >= 0 && $idx < $cap,
            "ring index {} = {} outside [0, {})",
            $name,
            $idx,
            $cap
        )
    };
}

/// Assert that a fill level never exceeds the advertised token count.
///
/// **Invariant**: `level <= token_num` (one slot of `capacity` stays empty)
macro_rules! debug_assert_level_bounded {
    ($level:expr, $tnum:expr) => {
        debug_assert!(
            $level <= $tnum,
            "level {} exceeds token capacity {}",
            $level,
            $tnum
        )
    };
}

/// Assert that free space never exceeds the advertised token count.
///
/// **Invariant**: `space <= token_num`
macro_rules! debug_assert_space_bounded {
    ($space:expr, $tnum:expr) => {
        debug_assert!(
            $space <= $tnum,
            "space {} exceeds token capacity {}",
            $space,
            $tnum
        )
    };
}

pub(crate) use debug_assert_level_bounded;
pub(crate) use debug_assert_ring_index;
pub(crate) use debug_assert_space_bounded;
