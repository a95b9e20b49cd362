// common.rs — engine print facade and error reporting
// Routes Com_Printf-style output through the `log` crate.

pub const ERR_FATAL: i32 = 0;
pub const ERR_DROP: i32 = 1;

/// General-purpose print, logged at info level.
pub fn com_printf(msg: &str) {
    log::info!("{}", msg.trim_end());
}

/// Engine error handler.
/// - `ERR_FATAL`: logs and panics.
/// - `ERR_DROP`: logs the error and returns so the caller can recover.
pub fn com_error(code: i32, msg: &str) {
    if code == ERR_FATAL {
        log::error!("Fatal error: {}", msg);
        panic!("Fatal error: {}", msg);
    }
    log::error!("********************\nERROR: {}\n********************", msg);
}
