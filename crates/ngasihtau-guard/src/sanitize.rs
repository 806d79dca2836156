//! Input sanitation for externally supplied strings.

/// Strips NUL and every control character below 0x20 except `\n` and `\t`,
/// trims outer whitespace, and preserves all code points at or above 0x20.
pub fn sanitize_input(input: &str) -> String {
    input
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || (*c as u32) >= 0x20)
        .collect::<String>()
        .trim()
        .to_string()
}
