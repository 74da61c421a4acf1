//! Line counting for the diff budget.

/// Lines removed plus lines added between `old` and `new`, after trimming the
/// common leading and trailing lines. Creating a file counts every line;
/// deleting one counts every old line.
pub fn changed_line_count(old: &str, new: &str) -> u32 {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let prefix = old_lines
        .iter()
        .zip(&new_lines)
        .take_while(|(a, b)| a == b)
        .count();
    let old_rest = &old_lines[prefix..];
    let new_rest = &new_lines[prefix..];
    let suffix = old_rest
        .iter()
        .rev()
        .zip(new_rest.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let removed = old_rest.len() - suffix;
    let added = new_rest.len() - suffix;
    u32::try_from(removed + added).unwrap_or(u32::MAX)
}
