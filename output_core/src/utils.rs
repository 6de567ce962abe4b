use crate::hal::OsStatus;

/// Pack a four-character code into the big-endian `u32` the HAL uses for
/// selectors, scopes and most status codes.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    ((code[0] as u32) << 24) | ((code[1] as u32) << 16) | ((code[2] as u32) << 8) | code[3] as u32
}

/// Render an `OSStatus` for logs and error messages.
///
/// HAL errors are usually four-character codes (`'who?'`, `'!obj'`), which are far
/// easier to look up than their decimal value, so printable codes are shown as text.
pub fn describe_status(status: OsStatus) -> String {
    let bytes = status.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        format!("'{}' ({})", String::from_utf8_lossy(&bytes), status)
    } else {
        format!("{}", status)
    }
}

/// Clamp a requested volume into `[0.0, 1.0]`. NaN is treated as silence.
pub fn clamp_level(level: f32) -> f32 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}
