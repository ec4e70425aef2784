//! Text rendering for container error messages.
//!
//! Type names coming from [`std::any::type_name`] are long and path-heavy;
//! these helpers keep error output readable.

/// Joins a resolution chain with arrows.
///
/// ```
/// use khidma_support::rendering::render_chain;
///
/// let chain = ["UserController", "UserService", "UserController"];
/// assert_eq!(render_chain(&chain), "UserController → UserService → UserController");
/// ```
pub fn render_chain(chain: &[impl AsRef<str>]) -> String {
    chain
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join(" → ")
}

/// Renders items as an indented bullet list, one per line.
///
/// Each line starts with a newline so the result can be appended to a
/// headline.
pub fn render_bullets(items: &[impl AsRef<str>]) -> String {
    let mut out = String::new();
    for item in items {
        out.push_str("\n    - ");
        out.push_str(item.as_ref());
    }
    out
}

/// Drops module paths from a fully qualified type name, keeping generics.
///
/// ```
/// use khidma_support::rendering::shorten_type_name;
///
/// assert_eq!(shorten_type_name("app::services::UserService"), "UserService");
/// assert_eq!(
///     shorten_type_name("alloc::sync::Arc<dyn app::security::PasswordHasher>"),
///     "Arc<dyn PasswordHasher>"
/// );
/// ```
pub fn shorten_type_name(full_name: &str) -> String {
    let mut result = String::with_capacity(full_name.len());
    let mut segment = String::new();
    let mut chars = full_name.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                segment.clear();
            }
            '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | '&' => {
                result.push_str(&segment);
                result.push(ch);
                segment.clear();
            }
            _ => segment.push(ch),
        }
    }

    result.push_str(&segment);
    result
}

/// Picks registered names that look like the requested one.
///
/// Used for "did you mean" hints when a service is missing. Matching is on
/// the shortened, lowercased names: containment scores highest, then a shared
/// prefix of at least three characters.
pub fn suggest_similar(requested: &str, available: &[&str], max_suggestions: usize) -> Vec<String> {
    let wanted = shorten_type_name(requested).to_lowercase();

    let mut scored: Vec<(&str, usize)> = available
        .iter()
        .filter_map(|&name| {
            let short = shorten_type_name(name).to_lowercase();
            if short == wanted {
                return None;
            }
            if short.contains(&wanted) || wanted.contains(&short) {
                return Some((name, 100));
            }

            let common = short
                .chars()
                .zip(wanted.chars())
                .take_while(|(a, b)| a == b)
                .count();
            (common >= 3).then_some((name, common * 10))
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    scored
        .into_iter()
        .take(max_suggestions)
        .map(|(name, _)| name.to_string())
        .collect()
}
