//! Operator reduction over child outcomes.

use crate::model::Operator;

/// Combine child results under `op`.
///
/// - AND: every result true, vacuously true when empty
/// - OR: at least one true, false when empty
/// - XOR: exactly one true (not pairwise parity), false when empty
pub fn reduce(results: &[bool], op: Operator) -> bool {
    match op {
        Operator::And => results.iter().all(|r| *r),
        Operator::Or => results.iter().any(|r| *r),
        Operator::Xor => results.iter().filter(|r| **r).count() == 1,
    }
}
