//! Invariant checks that must not take a recording down with them.
//!
//! A broken size invariant on the hot path is a bug, but aborting a
//! transfer over it destroys data that could still have been captured. So:
//! debug builds panic like a plain `assert!`, release builds log the
//! violation through `tracing` and keep the data moving.

#[macro_export]
macro_rules! soft_assert {
    ($cond:expr $(,)?) => {
        if cfg!(debug_assertions) {
            assert!($cond);
        } else if !$cond {
            tracing::error!("invariant broken: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) {
            assert!($cond, $($arg)+);
        } else if !$cond {
            tracing::error!("invariant broken: {}", format_args!($($arg)+));
        }
    };
}

#[macro_export]
macro_rules! soft_assert_eq {
    ($left:expr, $right:expr $(,)?) => {
        if cfg!(debug_assertions) {
            assert_eq!($left, $right);
        } else if $left != $right {
            tracing::error!(
                "invariant broken: {} (left {:?}, right {:?})",
                stringify!($left == $right),
                $left,
                $right,
            );
        }
    };
}

#[cfg(test)]
mod test {
    #[test]
    fn holding_invariants_pass_quietly() {
        soft_assert!(1 + 1 == 2);
        soft_assert!(true, "never printed {}", 42);
        soft_assert_eq!(2 * 2, 4);
    }

    #[test]
    #[should_panic]
    fn broken_invariants_panic_in_debug() {
        soft_assert!(1 > 2, "checked in debug test builds");
    }
}
