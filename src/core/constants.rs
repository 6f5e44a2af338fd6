// ============================================================================
// spark-recompose - Constants
// Flag constants for scope state and scheduler defaults
// ============================================================================

// =============================================================================
// SCOPE TYPE FLAGS
// =============================================================================

/// Scope is the root of a composition
pub const ROOT_SCOPE: u32 = 1 << 0;

/// Scope was produced by a parent scope's run (slot-keyed child)
pub const CHILD_SCOPE: u32 = 1 << 1;

// =============================================================================
// SCOPE STATE FLAGS
// =============================================================================

/// Scope is up-to-date with every cell it read
pub const CLEAN: u32 = 1 << 10;

/// Scope read a cell that has since changed and is waiting for a pass
pub const INVALID: u32 = 1 << 11;

/// Scope body is currently executing
pub const SCOPE_IS_RUNNING: u32 = 1 << 12;

/// Scope belongs to a paused composition; invalidations are held
pub const PAUSED: u32 = 1 << 14;

/// Scope has completed at least one run
pub const SCOPE_RAN: u32 = 1 << 15;

/// Last run of the scope returned an error
pub const RUN_FAILED: u32 = 1 << 16;

// =============================================================================
// STATUS MASK (for clearing status bits)
// =============================================================================

/// Mask to clear the status bits (CLEAN, INVALID)
pub const STATUS_MASK: u32 = !(CLEAN | INVALID);

// =============================================================================
// SCHEDULER DEFAULTS
// =============================================================================

/// Consecutive passes one flush may run before the runtime reports
/// `ReentrantWriteOverflow`.
pub const DEFAULT_MAX_PASSES: usize = 100;

/// Replay count of a broadcast stream when none is configured
pub const DEFAULT_REPLAY: usize = 0;

/// Extra (non-replay) buffer slots of a broadcast stream when none is configured
pub const DEFAULT_EXTRA_BUFFER: usize = 0;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_distinct() {
        let all_flags = [
            ROOT_SCOPE,
            CHILD_SCOPE,
            CLEAN,
            INVALID,
            SCOPE_IS_RUNNING,
            PAUSED,
            SCOPE_RAN,
            RUN_FAILED,
        ];

        for (i, &a) in all_flags.iter().enumerate() {
            for (j, &b) in all_flags.iter().enumerate() {
                if i != j {
                    assert_eq!(a & b, 0, "Flags at index {} and {} overlap", i, j);
                }
            }
        }
    }

    #[test]
    fn status_mask_clears_status_bits() {
        let flags = CHILD_SCOPE | INVALID | SCOPE_RAN;
        let cleared = flags & STATUS_MASK;

        assert_eq!(cleared & INVALID, 0);
        assert_ne!(cleared & CHILD_SCOPE, 0);
        assert_ne!(cleared & SCOPE_RAN, 0);
    }

    #[test]
    fn defaults_are_sane() {
        assert!(DEFAULT_MAX_PASSES > 1);
        assert_eq!(DEFAULT_REPLAY, 0);
    }
}
