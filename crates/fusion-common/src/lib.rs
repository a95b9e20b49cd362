// fusion-common: shared math, cvars and the print facade

#![allow(clippy::needless_range_loop, clippy::float_cmp)]

pub mod common;
pub mod cvar;
pub mod q_shared;
