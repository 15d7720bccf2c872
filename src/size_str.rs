use std::fmt;

/// Human readable byte count for log output.
pub fn size_to_str<T: Into<u64> + fmt::Display + Copy>(size: T) -> String {
    let bytes: u64 = size.into();
    if bytes >= 1024 * 1024 * 1024 {
        format!(
            "{:.1} GiB ({} bytes)",
            bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            bytes
        )
    } else if bytes >= 1024 * 1024 {
        format!("{} MiB ({} bytes)", bytes / (1024 * 1024), bytes)
    } else if bytes >= 1024 {
        format!("{} KiB ({} bytes)", bytes / 1024, bytes)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_each_magnitude() {
        assert_eq!(size_to_str(17u32), "17 bytes");
        assert_eq!(size_to_str(2048u32), "2 KiB (2048 bytes)");
        assert_eq!(size_to_str(3 * 1024 * 1024u32), "3 MiB (3145728 bytes)");
        assert_eq!(
            size_to_str(3u64 * 1024 * 1024 * 1024),
            "3.0 GiB (3221225472 bytes)"
        );
    }
}
