mod check;

pub use check::{CheckArgs, cmd_check};
