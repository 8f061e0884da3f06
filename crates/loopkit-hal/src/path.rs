//! Device path helpers. Pure string classification, never touches the filesystem.

/// Partition path for a block device, following kernel naming: devices whose
/// name ends in a digit (`loop0`, `nvme0n1`, `mmcblk0`) get a `p` separator.
pub fn partition_path(disk: &str, num: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, num)
    } else {
        format!("{}{}", disk, num)
    }
}

/// Resolve a sub-partition path (`/dev/loop0p1`) to its base device (`/dev/loop0`).
///
/// Anything that is not `<base ending in a digit>p<digits>` is returned
/// unchanged. Stripping repeats until a fixed point, so the result is always
/// itself a base device.
pub fn resolve_base_device(path: &str) -> String {
    let mut current = path;
    while let Some(base) = strip_partition_suffix(current) {
        current = base;
    }
    current.to_string()
}

fn strip_partition_suffix(path: &str) -> Option<&str> {
    let pos = path.rfind('p')?;
    let (base, rest) = (&path[..pos], &path[pos + 1..]);
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !base.ends_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(base)
}

/// Index `N` of `<prefix>N`, e.g. `parse_loop_index("/dev/loop7", "/dev/loop") == Some(7)`.
pub fn parse_loop_index(path: &str, prefix: &str) -> Option<u32> {
    let digits = path.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// True for `<prefix>N` and any of its partitions (`<prefix>NpM`).
pub fn is_loop_device_path(path: &str, prefix: &str) -> bool {
    parse_loop_index(&resolve_base_device(path), prefix).is_some()
}
