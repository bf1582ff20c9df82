//! Sandbox policy: path guard, command guard, drop-with-reason validation,
//! hard-policy layering, and context rule merging.

pub mod guard;
pub mod hard;
pub mod rules;
pub mod validate;

pub use guard::{is_command_allowed, is_safe_relative_path, is_write_allowed};
pub use hard::{
    HardPolicy, UserHardPolicy, apply_deny_commands, build_system_hard_policy,
    load_user_hard_policy, merge_hard_policy, sanitize_user_hard,
};
pub use validate::{CommandOp, WriteOp, WriteTarget, validate_checks, validate_commands, validate_writes};
