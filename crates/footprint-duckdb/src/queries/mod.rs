pub mod events;
pub mod funnels;
pub mod identity;
pub mod retention;

/// `?start, ?start+1, ...` for an `IN (...)` list of `n` bound values.
pub(crate) fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
