//! Typed ID definitions.

use crate::define_id;

// =============================================================================
// Workers
// =============================================================================

define_id!(WorkerId);
